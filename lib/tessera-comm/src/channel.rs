// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logical channels and their transport-level tags.
//!
//! Every tag the substrate puts on the wire is produced by [`Channel::wire_tag`], and every
//! tag read off the wire goes through [`Channel::from_wire_tag`]. Protocol channels occupy
//! `1..USER_TAG_BASE`; caller-chosen channels start at [`USER_TAG_BASE`], so the two ranges
//! cannot collide.

use std::fmt;

/// First transport tag handed out to [`Channel::User`].
pub const USER_TAG_BASE: u32 = 1024;

const DISPATCH_TAG: u32 = 1;
const FORWARD_TAG: u32 = 2;
const NOTIFY_TAG: u32 = 3;
const BARRIER_TAG: u32 = 4;

/// A logical message class multiplexed over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Commands sent by the node that originated them.
    Dispatch,
    /// Commands relayed by a node that already holds them.
    Forward,
    /// Tensor-created notifications and the shutdown sentinel.
    Notify,
    /// Startup synchronization.
    Barrier,
    /// Caller-defined point-to-point conversation.
    User(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tag {0} does not belong to any channel")]
pub struct UnknownTag(pub u32);

impl Channel {
    pub const fn wire_tag(self) -> u32 {
        match self {
            Channel::Dispatch => DISPATCH_TAG,
            Channel::Forward => FORWARD_TAG,
            Channel::Notify => NOTIFY_TAG,
            Channel::Barrier => BARRIER_TAG,
            Channel::User(n) => USER_TAG_BASE + n as u32,
        }
    }

    pub fn from_wire_tag(tag: u32) -> Result<Self, UnknownTag> {
        match tag {
            DISPATCH_TAG => Ok(Channel::Dispatch),
            FORWARD_TAG => Ok(Channel::Forward),
            NOTIFY_TAG => Ok(Channel::Notify),
            BARRIER_TAG => Ok(Channel::Barrier),
            t if t >= USER_TAG_BASE => u16::try_from(t - USER_TAG_BASE)
                .map(Channel::User)
                .map_err(|_| UnknownTag(t)),
            t => Err(UnknownTag(t)),
        }
    }

    pub const fn is_protocol(self) -> bool {
        !matches!(self, Channel::User(_))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Dispatch => f.write_str("dispatch"),
            Channel::Forward => f.write_str("forward"),
            Channel::Notify => f.write_str("notify"),
            Channel::Barrier => f.write_str("barrier"),
            Channel::User(n) => write!(f, "user-{n}"),
        }
    }
}
