//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use derive_new::new;
use tokio::sync::mpsc::{
    self, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use tracing::{Instrument, debug_span};

use crate::collections::Tunnels;
use crate::config::InstanceCfg;
use crate::events;
use crate::ledger::{Ledger, LedgerCxt};
use crate::lsp::UserLsp;
use crate::error::Error;
use crate::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use crate::tasks::messages::input::{
    PathReplyMsg, PreemptedMsg, SignalingNotifMsg, TimerExpiryMsg,
    TopologyMsg, UserRequestMsg,
};
use crate::tasks::messages::output::{
    ResolverRequestMsg, SignalingCmdMsg, TeLinkBwUpdMsg, UserLspNotifMsg,
};
use crate::te::TeDatabase;
use crate::timers::Timers;

#[derive(Debug)]
pub struct Instance {
    // Instance name.
    pub name: String,
    // Instance configuration data.
    pub config: InstanceCfg,
    // TE links and component links.
    pub te_db: TeDatabase,
    // Bandwidth bookkeeping.
    pub ledger: Ledger,
    // Keyed one-shot timers.
    pub timers: Timers,
    // Head-end tunnels.
    pub tunnels: Tunnels,
    // User-level named LSPs.
    pub user_lsps: BTreeMap<String, UserLsp>,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Clone, Debug, new)]
pub struct InstanceChannelsTx {
    // Loopback towards the instance's own input.
    pub protocol_input: ProtocolInputChannelsTx,
    // Path resolver requests.
    pub resolver: UnboundedSender<ResolverRequestMsg>,
    // Signaling transport commands.
    pub signaling: UnboundedSender<SignalingCmdMsg>,
    // Maximum reservable bandwidth feedback.
    pub te_link: UnboundedSender<TeLinkBwUpdMsg>,
    // User LSP notifications.
    pub user: UnboundedSender<UserLspNotifMsg>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // User request.
    pub user_req: UnboundedSender<UserRequestMsg>,
    // Topology update.
    pub topology: UnboundedSender<TopologyMsg>,
    // Path resolver reply.
    pub path_reply: UnboundedSender<PathReplyMsg>,
    // Signaling transport notification.
    pub signaling: UnboundedSender<SignalingNotifMsg>,
    // Preempted reservation.
    pub preempted: UnboundedSender<PreemptedMsg>,
    // Timer expiration.
    pub timer: Sender<TimerExpiryMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    // User request.
    pub user_req: UnboundedReceiver<UserRequestMsg>,
    // Topology update.
    pub topology: UnboundedReceiver<TopologyMsg>,
    // Path resolver reply.
    pub path_reply: UnboundedReceiver<PathReplyMsg>,
    // Signaling transport notification.
    pub signaling: UnboundedReceiver<SignalingNotifMsg>,
    // Preempted reservation.
    pub preempted: UnboundedReceiver<PreemptedMsg>,
    // Timer expiration.
    pub timer: Receiver<TimerExpiryMsg>,
}

#[derive(Debug)]
pub struct OutputChannelsRx {
    pub resolver: UnboundedReceiver<ResolverRequestMsg>,
    pub signaling: UnboundedReceiver<SignalingCmdMsg>,
    pub te_link: UnboundedReceiver<TeLinkBwUpdMsg>,
    pub user: UnboundedReceiver<UserLspNotifMsg>,
}

// ===== impl Instance =====

impl Instance {
    pub fn new(config: InstanceCfg, tx: InstanceChannelsTx) -> Instance {
        let timers = Timers::new(tx.protocol_input.timer.clone());
        let ledger = Ledger::new(config.hold_interval());

        Instance {
            name: config.name.clone(),
            config,
            te_db: Default::default(),
            ledger,
            timers,
            tunnels: Default::default(),
            user_lsps: Default::default(),
            tx,
        }
    }

    // Processes input messages for as long as the input channels are open.
    pub async fn run(mut self, mut rx: ProtocolInputChannelsRx) {
        let span = debug_span!("rsvp-instance", name = %self.name);
        async move {
            while let Some(msg) = rx.recv().await {
                self.process_protocol_msg(msg);
            }
        }
        .instrument(span)
        .await
    }

    // Processes a single input message to completion.
    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        let result = match msg {
            // User request.
            ProtocolInputMsg::UserRequest(msg) => {
                events::process_user_request(self, msg)
            }
            // Topology update.
            ProtocolInputMsg::Topology(msg) => {
                events::process_topology(self, msg)
            }
            // Path resolver reply.
            ProtocolInputMsg::PathReply(msg) => {
                events::process_path_reply(self, msg)
            }
            // Signaling transport notification.
            ProtocolInputMsg::Signaling(msg) => {
                events::process_signaling(self, msg)
            }
            // Reservation preempted.
            ProtocolInputMsg::Preempted(msg) => {
                events::process_preempted(self, msg)
            }
            // Timer expiration.
            ProtocolInputMsg::TimerExpiry(msg) => {
                events::process_timer_expiry(self, msg)
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }

    // Splits the instance into the ledger and the collaborators its
    // mutations need.
    pub(crate) fn ledger_cxt(&mut self) -> (&mut Ledger, LedgerCxt<'_>) {
        let cxt = LedgerCxt {
            te_db: &mut self.te_db,
            timers: &mut self.timers,
            tx: &self.tx,
        };
        (&mut self.ledger, cxt)
    }
}

// ===== impl ProtocolInputChannelsTx =====

impl ProtocolInputChannelsTx {
    // Hands a message over to the input channel of its kind.
    pub fn send(&self, msg: ProtocolInputMsg) -> Result<(), Error> {
        let sent = match msg {
            ProtocolInputMsg::UserRequest(msg) => {
                self.user_req.send(msg).is_ok()
            }
            ProtocolInputMsg::Topology(msg) => self.topology.send(msg).is_ok(),
            ProtocolInputMsg::PathReply(msg) => {
                self.path_reply.send(msg).is_ok()
            }
            ProtocolInputMsg::Signaling(msg) => {
                self.signaling.send(msg).is_ok()
            }
            ProtocolInputMsg::Preempted(msg) => {
                self.preempted.send(msg).is_ok()
            }
            ProtocolInputMsg::TimerExpiry(msg) => {
                self.timer.try_send(msg).is_ok()
            }
        };
        if !sent {
            return Err(Error::InputChannelClosed);
        }
        Ok(())
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            msg = self.user_req.recv() => {
                msg.map(ProtocolInputMsg::UserRequest)
            }
            msg = self.topology.recv() => {
                msg.map(ProtocolInputMsg::Topology)
            }
            msg = self.path_reply.recv() => {
                msg.map(ProtocolInputMsg::PathReply)
            }
            msg = self.signaling.recv() => {
                msg.map(ProtocolInputMsg::Signaling)
            }
            msg = self.preempted.recv() => {
                msg.map(ProtocolInputMsg::Preempted)
            }
            msg = self.timer.recv() => {
                msg.map(ProtocolInputMsg::TimerExpiry)
            }
        }
    }

    // Returns the next input message that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<ProtocolInputMsg> {
        if let Ok(msg) = self.preempted.try_recv() {
            return Some(ProtocolInputMsg::Preempted(msg));
        }
        if let Ok(msg) = self.timer.try_recv() {
            return Some(ProtocolInputMsg::TimerExpiry(msg));
        }
        if let Ok(msg) = self.signaling.try_recv() {
            return Some(ProtocolInputMsg::Signaling(msg));
        }
        if let Ok(msg) = self.path_reply.try_recv() {
            return Some(ProtocolInputMsg::PathReply(msg));
        }
        if let Ok(msg) = self.topology.try_recv() {
            return Some(ProtocolInputMsg::Topology(msg));
        }
        self.user_req.try_recv().ok().map(ProtocolInputMsg::UserRequest)
    }
}

// ===== impl OutputChannelsRx =====

impl OutputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolOutputMsg> {
        tokio::select! {
            msg = self.resolver.recv() => {
                msg.map(ProtocolOutputMsg::Resolver)
            }
            msg = self.signaling.recv() => {
                msg.map(ProtocolOutputMsg::Signaling)
            }
            msg = self.te_link.recv() => {
                msg.map(ProtocolOutputMsg::TeLink)
            }
            msg = self.user.recv() => {
                msg.map(ProtocolOutputMsg::User)
            }
        }
    }
}

// ===== global functions =====

pub fn channels()
-> (InstanceChannelsTx, ProtocolInputChannelsRx, OutputChannelsRx) {
    let (user_reqp, user_reqc) = mpsc::unbounded_channel();
    let (topologyp, topologyc) = mpsc::unbounded_channel();
    let (path_replyp, path_replyc) = mpsc::unbounded_channel();
    let (signalingp, signalingc) = mpsc::unbounded_channel();
    let (preemptedp, preemptedc) = mpsc::unbounded_channel();
    let (timerp, timerc) = mpsc::channel(4);
    let (resolverp, resolverc) = mpsc::unbounded_channel();
    let (signaling_txp, signaling_txc) = mpsc::unbounded_channel();
    let (te_linkp, te_linkc) = mpsc::unbounded_channel();
    let (userp, userc) = mpsc::unbounded_channel();

    let protocol_input = ProtocolInputChannelsTx {
        user_req: user_reqp,
        topology: topologyp,
        path_reply: path_replyp,
        signaling: signalingp,
        preempted: preemptedp,
        timer: timerp,
    };
    let tx = InstanceChannelsTx::new(
        protocol_input,
        resolverp,
        signaling_txp,
        te_linkp,
        userp,
    );
    let rx = ProtocolInputChannelsRx {
        user_req: user_reqc,
        topology: topologyc,
        path_reply: path_replyc,
        signaling: signalingc,
        preempted: preemptedc,
        timer: timerc,
    };
    let output_rx = OutputChannelsRx {
        resolver: resolverc,
        signaling: signaling_txc,
        te_link: te_linkc,
        user: userc,
    };

    (tx, rx, output_rx)
}

// ===== unit tests =====
