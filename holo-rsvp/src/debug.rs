//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tracing::{debug, debug_span};

use crate::ledger::OwnerKey;
use crate::tasks::messages::input::PathResult;
use crate::tasks::messages::output::{
    ResolverRequestMsg, SignalingCmdMsg, UserLspNotifMsg,
};
use crate::te::{Bandwidth, IfIndex, PRIORITY_LEVELS, Priority, TeLinkId};
use crate::timers::TimerKey;
use crate::tunnel::{LspKey, TunnelKey, fsm};

// RSVP-TE debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // Tunnels and candidate LSPs
    TunnelCreate(&'a TunnelKey),
    TunnelDelete(&'a TunnelKey),
    TunnelFsmTransition(
        &'a TunnelKey,
        &'a fsm::Event,
        &'a fsm::State,
        &'a fsm::State,
    ),
    NoMatchingTunnel(&'a TunnelKey),
    LspCreate(&'a LspKey, Bandwidth),
    LspDelete(&'a LspKey),
    LspUp(&'a LspKey, Bandwidth),
    LspFailed(&'a LspKey, Option<Ipv4Addr>),
    LspDuplicate(&'a LspKey, u16),
    RetryScheduled(&'a TunnelKey, u32),
    // External collaborators
    PathRequest(&'a ResolverRequestMsg),
    PathReply(&'a LspKey, &'a PathResult),
    SignalingTx(&'a SignalingCmdMsg),
    UserLspNotif(&'a UserLspNotifMsg),
    // User LSPs
    UserLspCreate(&'a str),
    UserLspUpdate(&'a str),
    UserLspDelete(&'a str),
    // Bandwidth ledger
    LedgerReserve(&'a OwnerKey, IfIndex, Priority, Bandwidth),
    LedgerCommit(&'a OwnerKey, IfIndex, Priority, Bandwidth),
    LedgerRelease(&'a OwnerKey, IfIndex, Priority),
    HoldTimerExpiry(&'a OwnerKey, IfIndex, Priority, Bandwidth),
    Preempt(&'a OwnerKey, &'a OwnerKey, IfIndex, Priority, Bandwidth),
    // Topology
    TeLinkUpdate(&'a TeLinkId),
    TeLinkBwUpd(&'a TeLinkId, &'a [Bandwidth; PRIORITY_LEVELS]),
    ComponentLinkCreate(IfIndex, &'a TeLinkId),
    ComponentLinkUpdate(IfIndex, &'a [Bandwidth; PRIORITY_LEVELS]),
    ComponentLinkDelete(IfIndex),
    // Timers
    TimerExpiry(&'a TimerKey),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::TunnelCreate(tunnel)
            | Debug::TunnelDelete(tunnel)
            | Debug::NoMatchingTunnel(tunnel) => {
                // Parent span(s): rsvp-instance
                debug_span!("tunnel", %tunnel).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::TunnelFsmTransition(tunnel, event, old_state, new_state) => {
                // Parent span(s): rsvp-instance
                debug_span!("tunnel", %tunnel).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?event, ?old_state, ?new_state, "{}", self);
                    })
                });
            }
            Debug::RetryScheduled(tunnel, retries_left) => {
                // Parent span(s): rsvp-instance
                debug_span!("tunnel", %tunnel).in_scope(|| {
                    debug!(%retries_left, "{}", self);
                });
            }
            Debug::LspCreate(lsp, bw) | Debug::LspUp(lsp, bw) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug!(%bw, "{}", self);
                });
            }
            Debug::LspDelete(lsp) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::LspFailed(lsp, node) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug!(?node, "{}", self);
                });
            }
            Debug::LspDuplicate(lsp, existing) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug!(%existing, "{}", self);
                });
            }
            Debug::PathRequest(msg) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", lsp = %msg.lsp).in_scope(|| {
                    debug_span!("resolver").in_scope(|| {
                        let data = serde_json::to_string(&msg)
                            .unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::PathReply(lsp, result) => {
                // Parent span(s): rsvp-instance
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug_span!("resolver").in_scope(|| {
                        let data = serde_json::to_string(&result)
                            .unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::SignalingTx(msg) => {
                // Parent span(s): rsvp-instance
                let lsp = match msg {
                    SignalingCmdMsg::PathSend { lsp, .. }
                    | SignalingCmdMsg::PathTear { lsp } => lsp,
                };
                debug_span!("lsp", %lsp).in_scope(|| {
                    debug_span!("signaling").in_scope(|| {
                        let data =
                            serde_json::to_string(&msg).unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::UserLspNotif(msg) => {
                // Parent span(s): rsvp-instance
                let data = serde_json::to_string(&msg).unwrap_or_default();
                debug!(tunnel = %msg.tunnel, %data, "{}", self);
            }
            Debug::UserLspCreate(name)
            | Debug::UserLspUpdate(name)
            | Debug::UserLspDelete(name) => {
                // Parent span(s): rsvp-instance
                debug_span!("user-lsp", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::LedgerReserve(owner, out_if, priority, bw)
            | Debug::LedgerCommit(owner, out_if, priority, bw)
            | Debug::HoldTimerExpiry(owner, out_if, priority, bw) => {
                // Parent span(s): rsvp-instance
                debug_span!("ledger", %owner).in_scope(|| {
                    debug!(%out_if, %priority, %bw, "{}", self);
                });
            }
            Debug::LedgerRelease(owner, out_if, priority) => {
                // Parent span(s): rsvp-instance
                debug_span!("ledger", %owner).in_scope(|| {
                    debug!(%out_if, %priority, "{}", self);
                });
            }
            Debug::Preempt(preemptor, victim, out_if, priority, bw) => {
                // Parent span(s): rsvp-instance
                debug_span!("ledger", owner = %preemptor).in_scope(|| {
                    debug!(%victim, %out_if, %priority, %bw, "{}", self);
                });
            }
            Debug::TeLinkUpdate(te_link) => {
                // Parent span(s): rsvp-instance
                debug_span!("link", %te_link).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::TeLinkBwUpd(te_link, max_reservable) => {
                // Parent span(s): rsvp-instance
                debug_span!("link", %te_link).in_scope(|| {
                    debug!(?max_reservable, "{}", self);
                });
            }
            Debug::ComponentLinkCreate(ifindex, te_link) => {
                // Parent span(s): rsvp-instance
                debug_span!("link", %te_link).in_scope(|| {
                    debug!(%ifindex, "{}", self);
                });
            }
            Debug::ComponentLinkUpdate(ifindex, configured) => {
                // Parent span(s): rsvp-instance
                debug!(%ifindex, ?configured, "{}", self);
            }
            Debug::ComponentLinkDelete(ifindex) => {
                // Parent span(s): rsvp-instance
                debug!(%ifindex, "{}", self);
            }
            Debug::TimerExpiry(key) => {
                // Parent span(s): rsvp-instance
                debug!(?key, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::TunnelCreate(..) => {
                write!(f, "tunnel created")
            }
            Debug::TunnelDelete(..) => {
                write!(f, "tunnel deleted")
            }
            Debug::TunnelFsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::NoMatchingTunnel(..) => {
                write!(f, "tunnel no longer exists, ignoring event")
            }
            Debug::LspCreate(..) => {
                write!(f, "candidate LSP created")
            }
            Debug::LspDelete(..) => {
                write!(f, "candidate LSP deleted")
            }
            Debug::LspUp(..) => {
                write!(f, "LSP established")
            }
            Debug::LspFailed(..) => {
                write!(f, "LSP failed")
            }
            Debug::LspDuplicate(..) => {
                write!(f, "candidate follows the path of an existing LSP")
            }
            Debug::RetryScheduled(..) => {
                write!(f, "setup retry scheduled")
            }
            Debug::PathRequest(..) => {
                write!(f, "path request")
            }
            Debug::PathReply(..) => {
                write!(f, "path reply")
            }
            Debug::SignalingTx(..) => {
                write!(f, "signaling command")
            }
            Debug::UserLspNotif(..) => {
                write!(f, "user LSP notification")
            }
            Debug::UserLspCreate(..) => {
                write!(f, "user LSP created")
            }
            Debug::UserLspUpdate(..) => {
                write!(f, "user LSP updated")
            }
            Debug::UserLspDelete(..) => {
                write!(f, "user LSP deleted")
            }
            Debug::LedgerReserve(..) => {
                write!(f, "provisional reservation")
            }
            Debug::LedgerCommit(..) => {
                write!(f, "reservation committed")
            }
            Debug::LedgerRelease(..) => {
                write!(f, "reservation released")
            }
            Debug::HoldTimerExpiry(..) => {
                write!(f, "hold timer expired")
            }
            Debug::Preempt(..) => {
                write!(f, "preempting holder")
            }
            Debug::TeLinkUpdate(..) => {
                write!(f, "TE link updated")
            }
            Debug::TeLinkBwUpd(..) => {
                write!(f, "maximum reservable bandwidth updated")
            }
            Debug::ComponentLinkCreate(..) => {
                write!(f, "component link created")
            }
            Debug::ComponentLinkUpdate(..) => {
                write!(f, "component link updated")
            }
            Debug::ComponentLinkDelete(..) => {
                write!(f, "component link deleted")
            }
            Debug::TimerExpiry(..) => {
                write!(f, "timer expired")
            }
        }
    }
}
