//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use const_addrs::ip4;
use holo_rsvp::config::InstanceCfg;
use holo_rsvp::instance::{
    Instance, OutputChannelsRx, ProtocolInputChannelsRx, channels,
};
use holo_rsvp::ledger::{OwnerKey, ResvStyle};
use holo_rsvp::lsp::{SecondaryPathCfg, UserLspCfg};
use holo_rsvp::tasks::messages::ProtocolInputMsg;
use holo_rsvp::tasks::messages::input::{
    ComponentLinkUpdMsg, LspRequestMsg, PathReplyMsg, PathResult,
    SignalingNotifMsg, TimerExpiryMsg, TopologyMsg, UserRequestMsg,
};
use holo_rsvp::tasks::messages::output::{
    ResolverRequestMsg, SetupFailReason, SignalingCmdMsg, UserLspEvent,
};
use holo_rsvp::te::{Bandwidth, ComponentLink, IfIndex, TeLink, TeLinkId};
use holo_rsvp::timers::TimerKey;
use holo_rsvp::tunnel::{
    FirstHop, Hop, LspAttrs, LspKey, LspRoute, Tunnel, TunnelKey, fsm,
};
use maplit::btreeset;

const SRC: Ipv4Addr = ip4!("1.1.1.1");
const DST: Ipv4Addr = ip4!("9.9.9.9");

struct Harness {
    instance: Instance,
    input: ProtocolInputChannelsRx,
    output: OutputChannelsRx,
    sent: Vec<(LspKey, Bandwidth)>,
    tears: Vec<LspKey>,
}

// ===== impl Harness =====

impl Harness {
    // Instance attached to two TE links with one 1000-unit interface each.
    fn new(config: InstanceCfg) -> Harness {
        let (tx, input, output) = channels();
        let mut harness = Harness {
            instance: Instance::new(config, tx),
            input,
            output,
            sent: vec![],
            tears: vec![],
        };
        harness.add_link(1, 10, ip4!("3.3.3.3"));
        harness.add_link(2, 20, ip4!("4.4.4.4"));
        harness
    }

    fn add_link(&mut self, id: u32, ifindex: IfIndex, remote: Ipv4Addr) {
        let te_link = TeLink::new(
            TeLinkId(id),
            Ipv4Addr::new(10, 0, id as u8, 1),
            remote,
            Ipv4Addr::new(10, 0, id as u8, 2),
        );
        self.process(ProtocolInputMsg::Topology(TopologyMsg::TeLinkUpd(
            te_link,
        )));
        self.configure(id, ifindex, 1000);
    }

    fn configure(&mut self, id: u32, ifindex: IfIndex, bw: Bandwidth) {
        self.process(ProtocolInputMsg::Topology(
            TopologyMsg::ComponentLinkUpd(ComponentLinkUpdMsg {
                ifindex,
                te_link: TeLinkId(id),
                configured: [bw; 8],
            }),
        ));
    }

    // Processes a message along with everything the instance sent back to
    // itself.
    fn process(&mut self, msg: ProtocolInputMsg) {
        self.instance.process_protocol_msg(msg);
        while let Some(msg) = self.input.try_recv() {
            self.instance.process_protocol_msg(msg);
        }
    }

    fn request(
        &mut self,
        tunnel_id: Option<u16>,
        bw: Bandwidth,
        attrs: LspAttrs,
        force_resolve: bool,
    ) {
        let mut req = lsp_request(tunnel_id, bw, attrs);
        req.force_resolve = force_resolve;
        self.process(ProtocolInputMsg::UserRequest(UserRequestMsg::Lsp(req)));
    }

    // Answers the oldest pending resolver request.
    fn resolve(&mut self, result: PathResult) -> LspKey {
        let req = self.output.resolver.try_recv().unwrap();
        self.process(ProtocolInputMsg::PathReply(PathReplyMsg {
            lsp: req.lsp,
            result,
        }));
        req.lsp
    }

    fn resolver_requests(&mut self) -> Vec<ResolverRequestMsg> {
        let mut requests = vec![];
        while let Ok(req) = self.output.resolver.try_recv() {
            requests.push(req);
        }
        requests
    }

    fn drain_signaling(&mut self) {
        while let Ok(msg) = self.output.signaling.try_recv() {
            match msg {
                SignalingCmdMsg::PathSend { lsp, bw, .. } => {
                    self.sent.push((lsp, bw))
                }
                SignalingCmdMsg::PathTear { lsp } => self.tears.push(lsp),
            }
        }
    }

    // Takes the oldest pending setup, of the given tunnel if any.
    fn pending(&mut self, tunnel: Option<TunnelKey>) -> (LspKey, Bandwidth) {
        self.drain_signaling();
        let pos = self
            .sent
            .iter()
            .position(|(lsp, _)| tunnel.is_none_or(|key| lsp.tunnel == key))
            .unwrap();
        self.sent.remove(pos)
    }

    fn confirm(&mut self, lsp: LspKey, bw: Bandwidth) {
        self.process(ProtocolInputMsg::Signaling(SignalingNotifMsg::Up {
            lsp,
            bw,
            labels: vec![16],
        }));
    }

    // Confirms the oldest pending setup.
    fn signal_up(&mut self) -> LspKey {
        let (lsp, bw) = self.pending(None);
        self.confirm(lsp, bw);
        lsp
    }

    // Confirms the oldest pending setup of a tunnel.
    fn signal_up_tunnel(&mut self, key: TunnelKey) -> LspKey {
        let (lsp, bw) = self.pending(Some(key));
        self.confirm(lsp, bw);
        lsp
    }

    fn sent(&mut self) -> Vec<(LspKey, Bandwidth)> {
        self.drain_signaling();
        std::mem::take(&mut self.sent)
    }

    fn torn_down(&mut self) -> Vec<LspKey> {
        self.drain_signaling();
        std::mem::take(&mut self.tears)
    }

    fn events(&mut self) -> Vec<(TunnelKey, UserLspEvent)> {
        let mut events = vec![];
        while let Ok(msg) = self.output.user.try_recv() {
            events.push((msg.tunnel, msg.event));
        }
        events
    }

    // Latest bandwidth advertisement of a TE link.
    fn advertised(&mut self, te_link: TeLinkId) -> Option<[Bandwidth; 8]> {
        let mut advertised = None;
        while let Ok(msg) = self.output.te_link.try_recv() {
            if msg.te_link == te_link {
                advertised = Some(msg.max_reservable);
            }
        }
        advertised
    }

    fn expire(&mut self, key: TimerKey) {
        let seqno = self.instance.timers.seqno(&key).unwrap();
        self.process(ProtocolInputMsg::TimerExpiry(TimerExpiryMsg {
            key,
            seqno,
        }));
    }

    fn tunnel(&self, key: &TunnelKey) -> &Tunnel {
        self.instance.tunnels.get_by_key(key).unwrap().1
    }

    fn state(&self, key: &TunnelKey) -> fsm::State {
        self.tunnel(key).state
    }

    fn link(&self, ifindex: IfIndex) -> &ComponentLink {
        self.instance.te_db.component_link(ifindex).unwrap()
    }

    fn held(&self, owner: &OwnerKey, out_if: IfIndex, prio: u8) -> Bandwidth {
        self.instance
            .ledger
            .entry(owner, out_if, prio)
            .map(|entry| entry.bw)
            .unwrap_or(0)
    }
}

// ===== helper functions =====

fn lsp_request(
    tunnel_id: Option<u16>,
    bw: Bandwidth,
    attrs: LspAttrs,
) -> LspRequestMsg {
    LspRequestMsg {
        dst: DST,
        src: SRC,
        tunnel_id,
        bw,
        attrs,
        style: None,
        path: None,
        exclude: Default::default(),
        force_resolve: false,
    }
}

fn lsp_key(tunnel_id: u16, lsp_id: u16) -> LspKey {
    LspKey {
        tunnel: tunnel_key(tunnel_id),
        lsp_id,
    }
}

fn tunnel_key(tunnel_id: u16) -> TunnelKey {
    TunnelKey {
        dst: DST,
        tunnel_id,
        src: SRC,
    }
}

fn owner(tunnel_id: u16) -> OwnerKey {
    let lsp = LspKey {
        tunnel: tunnel_key(tunnel_id),
        lsp_id: 1,
    };
    OwnerKey::new(&lsp, ResvStyle::SharedExplicit)
}

// User LSP with one hot-standby secondary path.
fn user_lsp_cfg() -> UserLspCfg {
    UserLspCfg {
        name: "to-pe9".to_owned(),
        dst: DST,
        src: SRC,
        bw: 100,
        attrs: LspAttrs::new(4, 4),
        style: None,
        primary: vec![],
        secondaries: vec![SecondaryPathCfg {
            hops: vec![],
            hot_standby: true,
        }],
        retry_limit: None,
        retry_interval: None,
        adaptivity_interval: None,
    }
}

// Route leaving through TE link 1 (interface 10) or 2 (interface 20).
fn route(te_link: u32) -> PathResult {
    let (node, out_if) = match te_link {
        1 => (ip4!("3.3.3.3"), 10),
        _ => (ip4!("4.4.4.4"), 20),
    };
    let hops = vec![
        Hop {
            node,
            addr: Ipv4Addr::new(10, 0, te_link as u8, 2),
            loose: false,
        },
        Hop {
            node: DST,
            addr: DST,
            loose: false,
        },
    ];
    let first_hop = FirstHop {
        te_link: TeLinkId(te_link),
        out_if,
    };
    PathResult::Resolved(LspRoute::Explicit { hops, first_hop })
}

// ===== tests =====

#[tokio::test]
async fn reoptimization_keeps_closest_bandwidth() {
    let mut harness = Harness::new(InstanceCfg::default());
    let key = tunnel_key(1);
    let attrs = LspAttrs::new(3, 3);

    harness.request(None, 120, attrs, false);
    harness.resolve(route(1));
    harness.signal_up();
    assert_eq!(harness.held(&owner(1), 10, 3), 120);

    // Two make-before-break candidates on the same shared reservation.
    harness.request(Some(1), 80, attrs, true);
    harness.resolve(route(1));
    harness.request(Some(1), 100, attrs, true);
    harness.resolve(route(1));

    // The 80 candidate is no closer to 100 than the working 120 one.
    let lsp2 = harness.signal_up();
    assert_eq!(lsp2.lsp_id, 2);
    assert_eq!(
        harness.instance.tunnels.get_by_key(&key).unwrap().1.working,
        Some(1)
    );

    let lsp3 = harness.signal_up();
    assert_eq!(lsp3.lsp_id, 3);
    let (_, tunnel) = harness.instance.tunnels.get_by_key(&key).unwrap();
    assert_eq!(tunnel.working, Some(3));
    assert_eq!(tunnel.allocated_bw, 100);
    assert_eq!(tunnel.lsps.len(), 1);
    assert_eq!(harness.state(&key), fsm::State::Established);

    // The shared reservation shrinks to the surviving candidate.
    assert_eq!(harness.held(&owner(1), 10, 3), 100);
    assert_eq!(
        harness.torn_down(),
        vec![
            LspKey {
                tunnel: key,
                lsp_id: 2
            },
            LspKey {
                tunnel: key,
                lsp_id: 1
            },
        ]
    );
    assert_eq!(
        harness.events(),
        vec![
            (key, UserLspEvent::Up { lsp_id: 1, bw: 120 }),
            (key, UserLspEvent::BandwidthChanged { bw: 100 }),
        ]
    );
}

#[tokio::test]
async fn retry_limit_exceeded() {
    let config = InstanceCfg {
        setup_retry_count: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let key = tunnel_key(1);

    harness.request(None, 100, LspAttrs::new(7, 7), false);
    for attempt in 0..3 {
        harness.resolve(PathResult::Unreachable);
        if attempt < 2 {
            assert_eq!(harness.state(&key), fsm::State::Retrying);
            harness.expire(TimerKey::SetupRetry(key));
        }
    }

    // Initial attempt plus two retries, then nothing more.
    assert!(harness.output.resolver.try_recv().is_err());
    assert_eq!(harness.state(&key), fsm::State::Failed);
    assert!(!harness.instance.timers.is_active(&TimerKey::SetupRetry(key)));
    let (_, tunnel) = harness.instance.tunnels.get_by_key(&key).unwrap();
    assert!(tunnel.lsps.is_empty());

    let events = harness.events();
    let failures = events
        .iter()
        .filter(|(_, event)| {
            *event == UserLspEvent::SetupFailed(SetupFailReason::Unreachable)
        })
        .count();
    assert_eq!(failures, 3);
    assert_eq!(
        events.last(),
        Some(&(key, UserLspEvent::RetryLimitExceeded))
    );
}

#[tokio::test]
async fn hot_standby_takes_over() {
    let mut harness = Harness::new(InstanceCfg::default());
    harness.process(ProtocolInputMsg::UserRequest(
        UserRequestMsg::UserLspCreate(user_lsp_cfg()),
    ));
    let (primary, secondary) = (tunnel_key(1), tunnel_key(2));

    // Primary through link 1, standby through link 2.
    assert_eq!(harness.resolve(route(1)).tunnel, primary);
    assert_eq!(harness.resolve(route(2)).tunnel, secondary);
    harness.signal_up();
    harness.signal_up();
    assert_eq!(harness.held(&owner(1), 10, 4), 100);
    assert_eq!(harness.held(&owner(2), 20, 4), 100);
    assert_eq!(harness.instance.user_lsps["to-pe9"].active, primary);
    assert_eq!(harness.instance.tunnels.get_by_name("to-pe9").count(), 2);
    harness.events();

    harness.process(ProtocolInputMsg::Signaling(SignalingNotifMsg::Failed {
        lsp: LspKey {
            tunnel: primary,
            lsp_id: 1,
        },
        node: Some(ip4!("3.3.3.3")),
    }));

    // Traffic moves without waiting for a new path.
    assert_eq!(harness.instance.user_lsps["to-pe9"].active, secondary);
    assert!(harness.output.resolver.try_recv().is_err());
    assert_eq!(harness.state(&primary), fsm::State::Retrying);
    assert_eq!(harness.held(&owner(1), 10, 4), 0);
    assert!(harness.torn_down().is_empty());
    let (_, tunnel) = harness.instance.tunnels.get_by_key(&primary).unwrap();
    assert_eq!(tunnel.exclude, btreeset! {ip4!("3.3.3.3")});

    let events = harness.events();
    assert!(events.contains(&(primary, UserLspEvent::Down)));
    assert!(events.contains(&(
        secondary,
        UserLspEvent::SwitchedToSecondary {
            from: primary,
            to: secondary
        }
    )));
}

#[tokio::test]
async fn preempted_tunnel_reroutes() {
    let mut harness = Harness::new(InstanceCfg::default());
    let (weak, strong) = (tunnel_key(1), tunnel_key(2));

    harness.request(None, 600, LspAttrs::new(7, 7), false);
    harness.resolve(route(1));
    harness.signal_up();
    assert_eq!(harness.held(&owner(1), 10, 7), 600);
    harness.events();

    harness.request(None, 600, LspAttrs::new(0, 0), false);
    harness.resolve(route(1));
    harness.signal_up();

    let link = harness.instance.te_db.component_link(10).unwrap();
    assert_eq!(link.reservable_vector(), [400; 8]);
    assert_eq!(harness.held(&owner(2), 10, 0), 600);
    assert!(!harness.instance.ledger.owns_anything(&owner(1)));

    // The preempted tunnel asks for a new path right away.
    let req = harness.output.resolver.try_recv().unwrap();
    assert_eq!(
        req.lsp,
        LspKey {
            tunnel: weak,
            lsp_id: 2
        }
    );
    assert_eq!(harness.state(&weak), fsm::State::Rerouting);
    assert_eq!(
        harness.torn_down(),
        vec![LspKey {
            tunnel: weak,
            lsp_id: 1
        }]
    );

    let events = harness.events();
    assert!(events.contains(&(weak, UserLspEvent::Preempted)));
    let up = UserLspEvent::Up { lsp_id: 1, bw: 600 };
    assert!(events.contains(&(strong, up)));
}

#[tokio::test]
async fn tunnel_delete_releases_bandwidth() {
    let mut harness = Harness::new(InstanceCfg::default());
    let key = tunnel_key(1);

    harness.request(None, 250, LspAttrs::new(5, 5), false);
    harness.resolve(route(2));
    harness.signal_up();
    let link = harness.instance.te_db.component_link(20).unwrap();
    assert_eq!(
        link.reservable_vector(),
        [1000, 1000, 1000, 1000, 1000, 750, 750, 750]
    );

    harness.process(ProtocolInputMsg::UserRequest(UserRequestMsg::LspDelete(
        key,
    )));
    assert!(harness.instance.tunnels.get_by_key(&key).is_none());
    assert!(!harness.instance.ledger.owns_anything(&owner(1)));
    let link = harness.instance.te_db.component_link(20).unwrap();
    assert_eq!(link.reservable_vector(), [1000; 8]);
    assert_eq!(harness.torn_down(), vec![LspKey { tunnel: key, lsp_id: 1 }]);
}

#[tokio::test]
async fn hold_expires_before_confirmation() {
    let mut harness = Harness::new(InstanceCfg::default());
    let owner = owner(1);

    harness.request(None, 100, LspAttrs::new(3, 3), false);
    harness.resolve(route(1));
    let entry = harness.instance.ledger.entry(&owner, 10, 3).unwrap();
    assert_eq!((entry.bw, entry.pre_alloc_bw), (0, 100));

    // The unconfirmed hold goes back to the link exactly once.
    harness.expire(TimerKey::Hold {
        owner,
        te_link: TeLinkId(1),
        out_if: 10,
        priority: 3,
    });
    assert!(harness.instance.ledger.entry(&owner, 10, 3).is_none());
    assert_eq!(harness.link(10).reservable_vector(), [1000; 8]);
    assert!(harness.link(10).conserved());

    // A late confirmation reserves from scratch.
    harness.signal_up();
    assert_eq!(harness.held(&owner, 10, 3), 100);
    assert_eq!(
        harness.link(10).reservable_vector(),
        [1000, 1000, 1000, 900, 900, 900, 900, 900]
    );
    assert!(harness.link(10).conserved());
    assert_eq!(harness.state(&tunnel_key(1)), fsm::State::Established);
}

#[tokio::test]
async fn confirmation_beyond_hold_keeps_setup_priority() {
    let mut harness = Harness::new(InstanceCfg::default());
    harness.configure(1, 10, 100);
    let key = tunnel_key(2);

    harness.request(None, 90, LspAttrs::new(3, 3), false);
    harness.resolve(route(1));
    harness.signal_up();

    // Held at 2 but set up at 5, so the priority 3 holder is out of reach.
    harness.request(None, 10, LspAttrs::new(5, 2), false);
    harness.resolve(route(1));
    assert_eq!(
        harness.link(10).reservable_vector(),
        [100, 100, 90, 0, 0, 0, 0, 0]
    );
    harness.events();

    // The transport confirms more than what was held.
    let (lsp, _) = harness.pending(Some(key));
    harness.confirm(lsp, 50);

    assert_eq!(harness.held(&owner(1), 10, 3), 90);
    assert!(!harness.instance.ledger.owns_anything(&owner(2)));
    assert_eq!(
        harness.link(10).reservable_vector(),
        [100, 100, 100, 10, 10, 10, 10, 10]
    );
    assert_eq!(harness.state(&key), fsm::State::Retrying);
    assert_eq!(harness.torn_down(), vec![lsp]);
    assert_eq!(
        harness.events(),
        vec![(
            key,
            UserLspEvent::SetupFailed(SetupFailReason::AdmissionDenied)
        )]
    );
}

#[tokio::test]
async fn admission_on_hundred_unit_link() {
    let mut harness = Harness::new(InstanceCfg::default());
    harness.configure(1, 10, 100);
    let (low, big) = (tunnel_key(2), tunnel_key(3));

    harness.request(None, 50, LspAttrs::new(3, 3), false);
    harness.resolve(route(1));
    harness.signal_up();
    harness.request(None, 30, LspAttrs::new(6, 6), false);
    harness.resolve(route(1));
    harness.signal_up();
    assert_eq!(
        harness.link(10).reservable_vector(),
        [100, 100, 100, 50, 50, 50, 20, 20]
    );
    harness.events();

    // Even preempting every looser holder leaves 120 out of reach.
    harness.request(None, 120, LspAttrs::new(3, 3), false);
    harness.resolve(route(1));
    assert_eq!(harness.state(&big), fsm::State::Retrying);
    assert!(harness.sent().is_empty());
    assert_eq!(harness.held(&owner(2), 10, 6), 30);
    assert_eq!(
        harness.link(10).reservable_vector(),
        [100, 100, 100, 50, 50, 50, 20, 20]
    );
    assert_eq!(
        harness.events(),
        vec![(
            big,
            UserLspEvent::SetupFailed(SetupFailReason::AdmissionDenied)
        )]
    );

    // A smaller request fits by preempting the priority 6 holder.
    harness.request(Some(3), 40, LspAttrs::new(3, 3), false);
    harness.resolve(route(1));
    harness.signal_up_tunnel(big);
    assert_eq!(harness.held(&owner(3), 10, 3), 40);
    assert_eq!(harness.held(&owner(1), 10, 3), 50);
    assert!(!harness.instance.ledger.owns_anything(&owner(2)));
    assert_eq!(
        harness.link(10).reservable_vector(),
        [100, 100, 100, 10, 10, 10, 10, 10]
    );
    assert!(harness.link(10).conserved());
    assert!(harness.events().contains(&(low, UserLspEvent::Preempted)));
    assert_eq!(harness.torn_down(), vec![lsp_key(2, 1)]);
}

#[tokio::test]
async fn bandwidth_decrease_in_place() {
    let mut harness = Harness::new(InstanceCfg::default());
    let key = tunnel_key(1);
    let attrs = LspAttrs::new(3, 3);

    harness.request(None, 100, attrs, false);
    harness.resolve(route(1));
    let lsp = harness.signal_up();
    harness.events();

    // The working LSP is refreshed with less bandwidth.
    harness.request(Some(1), 60, attrs, false);
    assert!(harness.resolver_requests().is_empty());
    assert_eq!(harness.sent(), vec![(lsp, 60)]);
    assert!(harness.torn_down().is_empty());
    assert_eq!(harness.held(&owner(1), 10, 3), 60);
    assert_eq!(harness.link(10).reservable(3), 940);

    let tunnel = harness.tunnel(&key);
    assert_eq!(tunnel.working, Some(1));
    assert_eq!(tunnel.allocated_bw, 60);
    assert_eq!(tunnel.lsps[&1].bw, 60);
    assert_eq!(harness.state(&key), fsm::State::Established);
    assert_eq!(
        harness.events(),
        vec![(key, UserLspEvent::BandwidthChanged { bw: 60 })]
    );
}

#[tokio::test]
async fn bandwidth_increase_over_working_path() {
    let mut harness = Harness::new(InstanceCfg::default());
    let key = tunnel_key(1);
    let attrs = LspAttrs::new(3, 3);

    // Link from the first hop towards the destination.
    let mut downstream =
        TeLink::new(TeLinkId(3), ip4!("10.0.3.1"), DST, DST);
    downstream.advertised = [50; 8];
    harness.process(ProtocolInputMsg::Topology(TopologyMsg::TeLinkUpd(
        downstream.clone(),
    )));

    harness.request(None, 60, attrs, false);
    harness.resolve(route(1));
    harness.signal_up();
    harness.events();

    // Only the 30 extra units have to fit downstream.
    harness.request(Some(1), 90, attrs, false);
    assert!(harness.resolver_requests().is_empty());
    let entry = harness.instance.ledger.entry(&owner(1), 10, 3).unwrap();
    assert_eq!((entry.bw, entry.pre_alloc_bw), (60, 30));
    let (lsp, bw) = harness.pending(Some(key));
    assert_eq!((lsp, bw), (lsp_key(1, 2), 90));

    harness.confirm(lsp, bw);
    assert_eq!(harness.held(&owner(1), 10, 3), 90);
    assert_eq!(harness.link(10).reservable(3), 910);
    assert_eq!(harness.tunnel(&key).working, Some(2));
    assert_eq!(harness.torn_down(), vec![lsp_key(1, 1)]);
    assert_eq!(
        harness.events(),
        vec![(key, UserLspEvent::BandwidthChanged { bw: 90 })]
    );

    // Past what the downstream link advertises, a new path is needed.
    downstream.advertised = [10; 8];
    harness.process(ProtocolInputMsg::Topology(TopologyMsg::TeLinkUpd(
        downstream,
    )));
    harness.request(Some(1), 150, attrs, false);
    assert!(harness.sent().is_empty());
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(1, 3));
    assert_eq!(requests[0].bw, 150);
    assert_eq!(harness.state(&key), fsm::State::Reoptimizing);
}

#[tokio::test]
async fn adaptivity_finds_same_path() {
    let config = InstanceCfg {
        adaptivity_interval: Some(300),
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let key = tunnel_key(1);
    let attrs = LspAttrs::new(3, 3);
    let timer = TimerKey::Adaptivity(key);

    harness.request(None, 100, attrs, false);
    harness.resolve(route(1));
    harness.signal_up();
    assert_eq!(
        harness.instance.timers.interval(&timer),
        Some(Duration::from_secs(300))
    );
    let mut req = lsp_request(Some(1), 100, attrs);
    req.exclude = btreeset! {ip4!("5.5.5.5")};
    harness.process(ProtocolInputMsg::UserRequest(UserRequestMsg::Lsp(req)));
    harness.events();

    // The periodic check looks for a path free of old exclusions.
    harness.expire(timer);
    assert_eq!(harness.state(&key), fsm::State::Reoptimizing);
    assert!(harness.instance.timers.is_active(&timer));
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(1, 2));
    assert!(requests[0].exclude.is_empty());

    // Resolving to the working path changes nothing.
    harness.process(ProtocolInputMsg::PathReply(PathReplyMsg {
        lsp: lsp_key(1, 2),
        result: route(1),
    }));
    let tunnel = harness.tunnel(&key);
    assert_eq!(tunnel.working, Some(1));
    assert_eq!(tunnel.lsps.len(), 1);
    assert_eq!(harness.state(&key), fsm::State::Established);
    assert!(harness.sent().is_empty());
    assert!(harness.torn_down().is_empty());
    assert!(harness.events().is_empty());
    assert_eq!(harness.held(&owner(1), 10, 3), 100);
    assert!(harness.instance.timers.is_active(&timer));
}

#[tokio::test]
async fn secondary_rival_sharing_fewer_nodes_wins() {
    let mut harness = Harness::new(InstanceCfg::default());
    harness.process(ProtocolInputMsg::UserRequest(
        UserRequestMsg::UserLspCreate(user_lsp_cfg()),
    ));
    let (primary, secondary) = (tunnel_key(1), tunnel_key(2));

    // The standby first resolves through the primary's node.
    harness.resolve(route(1));
    harness.resolve(route(1));
    harness.signal_up_tunnel(primary);

    // A second attempt comes back disjoint from the primary path.
    harness.request(Some(2), 100, LspAttrs::new(4, 4), true);
    assert_eq!(harness.resolve(route(2)), lsp_key(2, 2));

    assert_eq!(harness.torn_down(), vec![lsp_key(2, 1)]);
    let tunnel = harness.tunnel(&secondary);
    assert_eq!(tunnel.lsps.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert!(harness.instance.ledger.entry(&owner(2), 10, 4).is_none());
    let entry = harness.instance.ledger.entry(&owner(2), 20, 4).unwrap();
    assert_eq!(entry.pre_alloc_bw, 100);

    harness.confirm(lsp_key(2, 2), 100);
    assert_eq!(harness.held(&owner(2), 20, 4), 100);
    assert_eq!(harness.state(&secondary), fsm::State::Established);
}

#[tokio::test]
async fn secondary_adjusted_after_reroute() {
    let mut harness = Harness::new(InstanceCfg::default());
    harness.process(ProtocolInputMsg::UserRequest(
        UserRequestMsg::UserLspCreate(user_lsp_cfg()),
    ));
    let (primary, secondary) = (tunnel_key(1), tunnel_key(2));

    // The standby comes up first, through the same node as the primary.
    harness.resolve(route(1));
    harness.resolve(route(1));
    harness.signal_up_tunnel(secondary);
    assert_eq!(harness.instance.user_lsps["to-pe9"].active, secondary);

    // The standby fails and starts rerouting.
    harness.process(ProtocolInputMsg::Signaling(SignalingNotifMsg::Failed {
        lsp: lsp_key(2, 1),
        node: None,
    }));
    assert_eq!(harness.state(&secondary), fsm::State::Rerouting);

    // The primary comes up meanwhile. Adjusting the standby has to wait.
    harness.signal_up_tunnel(primary);
    assert_eq!(harness.instance.user_lsps["to-pe9"].active, primary);
    assert!(harness.tunnel(&secondary).adjustment_required);
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(2, 2));
    assert!(requests[0].avoid.is_empty());

    // Once the reroute completes, the standby moves off the primary path.
    harness.process(ProtocolInputMsg::PathReply(PathReplyMsg {
        lsp: lsp_key(2, 2),
        result: route(1),
    }));
    harness.signal_up_tunnel(secondary);
    let tunnel = harness.tunnel(&secondary);
    assert!(!tunnel.adjustment_required);
    assert!(!tunnel.reroute_in_progress);
    assert_eq!(tunnel.working, Some(2));
    assert_eq!(harness.state(&secondary), fsm::State::Reoptimizing);
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(2, 3));
    assert_eq!(requests[0].avoid, vec![ip4!("3.3.3.3")]);
}

#[tokio::test]
async fn tunnel_ids_exhausted() {
    let config = InstanceCfg {
        tunnel_id_min: 5,
        tunnel_id_max: 6,
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let tunnel_ids = |harness: &Harness| {
        harness
            .instance
            .tunnels
            .iter()
            .map(|tunnel| tunnel.key.tunnel_id)
            .collect::<Vec<_>>()
    };

    for _ in 0..3 {
        harness.request(None, 10, LspAttrs::new(7, 7), false);
    }
    assert_eq!(tunnel_ids(&harness), vec![5, 6]);
    assert_eq!(harness.resolver_requests().len(), 2);

    // Deleting a tunnel frees its ID.
    harness.process(ProtocolInputMsg::UserRequest(UserRequestMsg::LspDelete(
        tunnel_key(5),
    )));
    harness.request(None, 10, LspAttrs::new(7, 7), false);
    assert_eq!(tunnel_ids(&harness), vec![5, 6]);
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(5, 1));
}

#[tokio::test]
async fn component_link_removal_evicts_holders() {
    let mut harness = Harness::new(InstanceCfg::default());
    let key = tunnel_key(1);

    harness.request(None, 100, LspAttrs::new(5, 5), false);
    harness.resolve(route(1));
    harness.signal_up();
    assert_eq!(harness.held(&owner(1), 10, 5), 100);
    harness.events();
    assert_eq!(
        harness.advertised(TeLinkId(1)),
        Some([1000, 1000, 1000, 1000, 1000, 900, 900, 900])
    );

    harness.process(ProtocolInputMsg::Topology(
        TopologyMsg::ComponentLinkDel(10),
    ));

    // Holders are treated as preempted and look for another path.
    assert!(harness.instance.te_db.component_link(10).is_none());
    let te_link = harness.instance.te_db.te_link(TeLinkId(1)).unwrap();
    assert!(te_link.components.is_empty());
    assert_eq!(harness.advertised(TeLinkId(1)), Some([0; 8]));
    assert!(!harness.instance.ledger.owns_anything(&owner(1)));
    assert_eq!(harness.torn_down(), vec![lsp_key(1, 1)]);
    assert_eq!(harness.state(&key), fsm::State::Rerouting);
    let requests = harness.resolver_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lsp, lsp_key(1, 2));
    assert_eq!(harness.events(), vec![(key, UserLspEvent::Preempted)]);
}
