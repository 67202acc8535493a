//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use tokio::sync::mpsc::Sender;

use crate::task::TimeoutTask;
use crate::timers::TimerKey;

//
// RSVP-TE tasks diagram:
//                                +--------------+
//                                |  user/admin  |
//                                +--------------+
//                                      | ^
//                                      | |
//                     user_req_rx (1x) V | (1x) user_tx
//                                +--------------+
//            topology_rx (1x) -> |              | -> (1x) resolver_tx
//          path_reply_rx (1x) -> |              |
//           signaling_rx (1x) -> |   instance   | -> (1x) signaling_tx
//           preempted_rx (1x) -> |              |
//                  timer (Nx) -> |              | -> (1x) te_link_tx
//                                +--------------+
//

// RSVP-TE inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use std::collections::BTreeSet;
        use std::net::Ipv4Addr;

        use super::*;
        use crate::ledger::{OwnerKey, ResvStyle};
        use crate::lsp::UserLspCfg;
        use crate::te::{
            Bandwidth, IfIndex, PRIORITY_LEVELS, Priority, TeLink, TeLinkId,
        };
        use crate::timers::TimerKey;
        use crate::tunnel::{
            Hop, Label, LspAttrs, LspKey, LspRoute, TunnelKey,
        };

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            UserRequest(UserRequestMsg),
            Topology(TopologyMsg),
            PathReply(PathReplyMsg),
            Signaling(SignalingNotifMsg),
            Preempted(PreemptedMsg),
            TimerExpiry(TimerExpiryMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub enum UserRequestMsg {
            Lsp(LspRequestMsg),
            LspDelete(TunnelKey),
            UserLspCreate(UserLspCfg),
            UserLspUpdate(UserLspCfg),
            UserLspDelete(String),
        }

        // Request for an LSP towards a destination.
        //
        // Without a tunnel ID a fresh tunnel is created. An explicit hop
        // list on an existing tunnel is a reroute request.
        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LspRequestMsg {
            pub dst: Ipv4Addr,
            pub src: Ipv4Addr,
            pub tunnel_id: Option<u16>,
            pub bw: Bandwidth,
            pub attrs: LspAttrs,
            pub style: Option<ResvStyle>,
            pub path: Option<Vec<Hop>>,
            pub exclude: BTreeSet<Ipv4Addr>,
            pub force_resolve: bool,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub enum TopologyMsg {
            TeLinkUpd(TeLink),
            ComponentLinkUpd(ComponentLinkUpdMsg),
            ComponentLinkDel(IfIndex),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct ComponentLinkUpdMsg {
            pub ifindex: IfIndex,
            pub te_link: TeLinkId,
            pub configured: [Bandwidth; PRIORITY_LEVELS],
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct PathReplyMsg {
            pub lsp: LspKey,
            pub result: PathResult,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub enum PathResult {
            Resolved(LspRoute),
            Pending,
            Unreachable,
            AdmissionDenied,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub enum SignalingNotifMsg {
            // Setup established. Under shared reservation styles, one label
            // per contributing sender.
            Up {
                lsp: LspKey,
                bw: Bandwidth,
                labels: Vec<Label>,
            },
            Failed {
                lsp: LspKey,
                node: Option<Ipv4Addr>,
            },
            Tear {
                lsp: LspKey,
            },
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct PreemptedMsg {
            pub owner: OwnerKey,
            pub te_link: TeLinkId,
            pub out_if: IfIndex,
            pub priority: Priority,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TimerExpiryMsg {
            pub key: TimerKey,
            pub seqno: u64,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use std::net::Ipv4Addr;

        use super::*;
        use crate::ledger::OwnerKey;
        use crate::te::{Bandwidth, PRIORITY_LEVELS, TeLinkId};
        use crate::tunnel::{Hop, LspAttrs, LspKey, LspRoute, TunnelKey};

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            Resolver(ResolverRequestMsg),
            Signaling(SignalingCmdMsg),
            TeLink(TeLinkBwUpdMsg),
            User(UserLspNotifMsg),
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct ResolverRequestMsg {
            pub lsp: LspKey,
            pub owner: OwnerKey,
            pub dst: Ipv4Addr,
            pub bw: Bandwidth,
            pub attrs: LspAttrs,
            pub path: Vec<Hop>,
            pub avoid: Vec<Ipv4Addr>,
            pub exclude: Vec<Ipv4Addr>,
            // Bandwidth already held by this tunnel along its working path.
            pub hints: Vec<BwHint>,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct BwHint {
            pub addr: Ipv4Addr,
            pub bw: Bandwidth,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub enum SignalingCmdMsg {
            PathSend {
                lsp: LspKey,
                route: LspRoute,
                bw: Bandwidth,
                attrs: LspAttrs,
            },
            PathTear {
                lsp: LspKey,
            },
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct TeLinkBwUpdMsg {
            pub te_link: TeLinkId,
            pub max_reservable: [Bandwidth; PRIORITY_LEVELS],
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct UserLspNotifMsg {
            pub name: Option<String>,
            pub tunnel: TunnelKey,
            pub event: UserLspEvent,
        }

        #[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
        pub enum UserLspEvent {
            Up { lsp_id: u16, bw: Bandwidth },
            Down,
            SetupFailed(SetupFailReason),
            RetryLimitExceeded,
            SwitchedToSecondary { from: TunnelKey, to: TunnelKey },
            SwitchedToPrimary { from: TunnelKey, to: TunnelKey },
            Preempted,
            BandwidthChanged { bw: Bandwidth },
        }

        #[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
        pub enum SetupFailReason {
            AdmissionDenied,
            Unreachable,
            Signaling(Option<Ipv4Addr>),
            Timeout,
            Preempted,
        }
    }
}

// ===== RSVP-TE tasks =====

// One-shot timer reporting its own key on expiry.
pub(crate) fn timer(
    key: TimerKey,
    seqno: u64,
    timeout: Duration,
    timerp: &Sender<messages::input::TimerExpiryMsg>,
) -> TimeoutTask {
    let timerp = timerp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::TimerExpiryMsg { key, seqno };
        let _ = timerp.send(msg).await;
    })
}
