//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::TryReserveError;
use std::net::Ipv4Addr;

use tracing::{error, warn};

use crate::ledger::OwnerKey;
use crate::te::{Bandwidth, IfIndex, Priority, TeLinkId};
use crate::tunnel::{LspKey, TunnelKey, fsm};

// RSVP-TE errors.
#[derive(Debug)]
pub enum Error {
    // Admission
    AdmissionDenied(IfIndex, Priority, Bandwidth),
    NoBandwidth(IfIndex, Priority, Bandwidth),
    InvalidPriority(Priority),
    InvalidPriorities(Priority, Priority),
    // Path setup
    RouteUnreachable(LspKey),
    RetryLimitExceeded(TunnelKey),
    TunnelIdExhausted(Ipv4Addr, Ipv4Addr),
    // Bookkeeping
    LedgerInconsistency(Inconsistency),
    AllocationFailure(TryReserveError),
    // Lookups
    TunnelNotFound(TunnelKey),
    LspNotFound(LspKey),
    UserLspNotFound(String),
    UserLspExists(String),
    TeLinkNotFound(TeLinkId),
    ComponentLinkNotFound(IfIndex),
    ComponentLinkExists(IfIndex),
    InvalidReservableBw(IfIndex),
    // Tunnel lifecycle
    TunnelFsmUnexpectedEvent(TunnelKey, fsm::State, fsm::Event),
    // Input relay
    InputChannelClosed,
}

// Bookkeeping defects. These are never retried.
#[derive(Debug)]
pub enum Inconsistency {
    ReleaseExceedsCommitted {
        ifindex: IfIndex,
        priority: Priority,
        bw: Bandwidth,
        committed: Bandwidth,
    },
    EntryNotFound {
        owner: OwnerKey,
        ifindex: IfIndex,
        priority: Priority,
    },
    IndexMismatch {
        owner: OwnerKey,
        ifindex: IfIndex,
        priority: Priority,
    },
    NoPreemptionCandidate {
        ifindex: IfIndex,
        priority: Priority,
    },
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::AdmissionDenied(ifindex, priority, bw)
            | Error::NoBandwidth(ifindex, priority, bw) => {
                warn!(%ifindex, %priority, %bw, "{}", self);
            }
            Error::InvalidPriority(priority) => {
                warn!(%priority, "{}", self);
            }
            Error::InvalidPriorities(setup, hold) => {
                warn!(%setup, %hold, "{}", self);
            }
            Error::RouteUnreachable(lsp) | Error::LspNotFound(lsp) => {
                warn!(%lsp, "{}", self);
            }
            Error::RetryLimitExceeded(tunnel)
            | Error::TunnelNotFound(tunnel) => {
                warn!(%tunnel, "{}", self);
            }
            Error::TunnelIdExhausted(dst, src) => {
                warn!(%dst, %src, "{}", self);
            }
            Error::LedgerInconsistency(inconsistency) => {
                error!(?inconsistency, "{}", self);
            }
            Error::AllocationFailure(error) => {
                error!(error = %with_source(error), "{}", self);
            }
            Error::UserLspNotFound(name) | Error::UserLspExists(name) => {
                warn!(%name, "{}", self);
            }
            Error::TeLinkNotFound(te_link) => {
                warn!(%te_link, "{}", self);
            }
            Error::ComponentLinkNotFound(ifindex)
            | Error::ComponentLinkExists(ifindex)
            | Error::InvalidReservableBw(ifindex) => {
                warn!(%ifindex, "{}", self);
            }
            Error::TunnelFsmUnexpectedEvent(tunnel, state, event) => {
                warn!(%tunnel, ?state, ?event, "{}", self);
            }
            Error::InputChannelClosed => {
                error!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AdmissionDenied(..) => {
                write!(f, "admission denied")
            }
            Error::NoBandwidth(..) => {
                write!(f, "not enough reservable bandwidth")
            }
            Error::InvalidPriority(..) => {
                write!(f, "invalid priority")
            }
            Error::InvalidPriorities(..) => {
                write!(f, "holding priority is looser than setup priority")
            }
            Error::RouteUnreachable(..) => {
                write!(f, "no route to destination")
            }
            Error::RetryLimitExceeded(..) => {
                write!(f, "setup retry limit exceeded")
            }
            Error::TunnelIdExhausted(..) => {
                write!(f, "no tunnel ID available")
            }
            Error::LedgerInconsistency(inconsistency) => {
                write!(f, "bandwidth ledger inconsistency: {inconsistency}")
            }
            Error::AllocationFailure(..) => {
                write!(f, "failed to allocate bookkeeping record")
            }
            Error::TunnelNotFound(..) => {
                write!(f, "tunnel not found")
            }
            Error::LspNotFound(..) => {
                write!(f, "LSP not found")
            }
            Error::UserLspNotFound(..) => {
                write!(f, "user LSP not found")
            }
            Error::UserLspExists(..) => {
                write!(f, "user LSP already exists")
            }
            Error::TeLinkNotFound(..) => {
                write!(f, "TE link not found")
            }
            Error::ComponentLinkNotFound(..) => {
                write!(f, "component link not found")
            }
            Error::ComponentLinkExists(..) => {
                write!(f, "component link already exists")
            }
            Error::InvalidReservableBw(..) => {
                write!(f, "invalid reservable bandwidth")
            }
            Error::TunnelFsmUnexpectedEvent(..) => {
                write!(f, "unexpected tunnel FSM event")
            }
            Error::InputChannelClosed => {
                write!(f, "instance input channel closed")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AllocationFailure(error) => Some(error),
            _ => None,
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(error: TryReserveError) -> Error {
        Error::AllocationFailure(error)
    }
}

// ===== impl Inconsistency =====

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inconsistency::ReleaseExceedsCommitted { .. } => {
                write!(f, "release exceeds committed bandwidth")
            }
            Inconsistency::EntryNotFound { .. } => {
                write!(f, "owner entry not found")
            }
            Inconsistency::IndexMismatch { .. } => {
                write!(f, "interface index out of sync with owner records")
            }
            Inconsistency::NoPreemptionCandidate { .. } => {
                write!(f, "no holder to preempt")
            }
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
