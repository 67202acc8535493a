//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::config::InstanceCfg;
use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Instance;
use crate::ledger::{OwnerKey, ResvStyle};
use crate::lifecycle;
use crate::te::{Bandwidth, IfIndex, Priority, TeLinkId, is_valid_priority};

pub type Label = u32;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct TunnelKey {
    pub dst: Ipv4Addr,
    pub tunnel_id: u16,
    pub src: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct LspKey {
    pub tunnel: TunnelKey,
    pub lsp_id: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Hop {
    pub node: Ipv4Addr,
    pub addr: Ipv4Addr,
    pub loose: bool,
}

// Local attachment of a path: the TE link and component link the first hop
// leaves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FirstHop {
    pub te_link: TeLinkId,
    pub out_if: IfIndex,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[derive(EnumAsInner)]
pub enum LspRoute {
    LocalEgress,
    DirectNextHop { hop: Hop, first_hop: FirstHop },
    Explicit { hops: Vec<Hop>, first_hop: FirstHop },
    Tunnel(TunnelKey),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct LspFlags: u8 {
        const LABEL_RECORDING = 0x01;
        const LOCAL_PROTECTION = 0x02;
        const SE_STYLE = 0x04;
    }
}

// Parameters that must match for two candidates to be interchangeable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LspAttrs {
    pub setup_prio: Priority,
    pub hold_prio: Priority,
    pub include_any: u32,
    pub exclude_any: u32,
    pub hop_limit: Option<u8>,
    pub flags: LspFlags,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum LspState {
    Resolving,
    Signaling,
    Up,
}

// Candidate LSP of a tunnel.
#[derive(Debug)]
pub struct Lsp {
    pub key: LspKey,
    pub owner: OwnerKey,
    pub bw: Bandwidth,
    pub attrs: LspAttrs,
    pub route: Option<LspRoute>,
    pub labels: Vec<Label>,
    pub state: LspState,
    pub exclude: BTreeSet<Ipv4Addr>,
    pub avoid: BTreeSet<Ipv4Addr>,
}

// Role of a tunnel inside a user-level LSP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum PathRole {
    Primary,
    Secondary { index: usize, hot_standby: bool },
}

#[derive(Clone, Debug)]
pub struct TunnelCfg {
    pub setup_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_limit: u32,
    pub resolver_retry_interval: Duration,
    pub adaptivity_interval: Option<Duration>,
}

#[derive(Debug)]
pub struct Tunnel {
    pub key: TunnelKey,
    pub name: Option<String>,
    pub role: Option<PathRole>,
    pub state: fsm::State,
    pub required_bw: Bandwidth,
    pub allocated_bw: Bandwidth,
    pub attrs: LspAttrs,
    pub style: ResvStyle,
    // Configured hop list. Empty means unconstrained.
    pub path: Vec<Hop>,
    pub exclude: BTreeSet<Ipv4Addr>,
    pub avoid: BTreeSet<Ipv4Addr>,
    pub working: Option<u16>,
    pub reroute_in_progress: bool,
    pub adjustment_required: bool,
    pub lsps: BTreeMap<u16, Lsp>,
    pub retries_left: u32,
    pub cfg: TunnelCfg,
    pub statistics: TunnelStatistics,
    next_lsp_id: u16,
}

#[derive(Debug)]
pub struct TunnelStatistics {
    pub create_time: DateTime<Utc>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub setup_failures: u32,
    pub reroutes: u32,
}

pub mod fsm {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub enum State {
        PathResolution,
        SignalingConfirmation,
        Established,
        Reoptimizing,
        Rerouting,
        Retrying,
        Failed,
    }

    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub enum Event {
        PathRequest,
        RerouteRequest,
        PathResolved,
        PathUnchanged,
        SignalingUp,
        SetupFailed,
        RetryTimer,
        RetryExhausted,
        AdaptivityTimer,
        WorkingLspFailed,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Action {
        Resolve,
        Reconcile,
        ScheduleRetry,
        Recover,
        GiveUp,
    }
}

// ===== impl TunnelKey =====

impl std::fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.src, self.tunnel_id, self.dst)
    }
}

// ===== impl LspKey =====

impl std::fmt::Display for LspKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tunnel, self.lsp_id)
    }
}

// ===== impl LspRoute =====

impl LspRoute {
    pub fn hops(&self) -> &[Hop] {
        match self {
            LspRoute::DirectNextHop { hop, .. } => std::slice::from_ref(hop),
            LspRoute::Explicit { hops, .. } => hops,
            LspRoute::LocalEgress | LspRoute::Tunnel(_) => &[],
        }
    }

    pub fn first_hop(&self) -> Option<FirstHop> {
        match self {
            LspRoute::DirectNextHop { first_hop, .. }
            | LspRoute::Explicit { first_hop, .. } => Some(*first_hop),
            LspRoute::LocalEgress | LspRoute::Tunnel(_) => None,
        }
    }

    // Whether both routes traverse the same hops, or ride the same carrying
    // tunnel.
    pub fn same_path(&self, other: &LspRoute) -> bool {
        match (self, other) {
            (LspRoute::LocalEgress, LspRoute::LocalEgress) => true,
            (LspRoute::Tunnel(a), LspRoute::Tunnel(b)) => a == b,
            (LspRoute::Tunnel(_), _) | (_, LspRoute::Tunnel(_)) => false,
            _ => {
                self.first_hop() == other.first_hop()
                    && self
                        .hops()
                        .iter()
                        .map(|hop| hop.addr)
                        .eq(other.hops().iter().map(|hop| hop.addr))
            }
        }
    }

    // Number of nodes this route shares with the given hop list.
    pub fn shared_nodes(&self, hops: &[Hop]) -> usize {
        self.hops()
            .iter()
            .filter(|hop| hops.iter().any(|other| other.node == hop.node))
            .count()
    }
}

// ===== impl LspAttrs =====

impl LspAttrs {
    pub fn new(setup_prio: Priority, hold_prio: Priority) -> LspAttrs {
        LspAttrs {
            setup_prio,
            hold_prio,
            include_any: 0,
            exclude_any: 0,
            hop_limit: None,
            flags: LspFlags::LABEL_RECORDING,
        }
    }

    // The holding priority may never be looser than the setup priority.
    pub fn validate(&self) -> Result<(), Error> {
        for priority in [self.setup_prio, self.hold_prio] {
            if !is_valid_priority(priority) {
                return Err(Error::InvalidPriority(priority));
            }
        }
        if self.hold_prio > self.setup_prio {
            return Err(Error::InvalidPriorities(
                self.setup_prio,
                self.hold_prio,
            ));
        }
        Ok(())
    }
}

// ===== impl Lsp =====

impl Lsp {
    pub fn is_up(&self) -> bool {
        self.state == LspState::Up
    }
}

// ===== impl TunnelCfg =====

impl From<&InstanceCfg> for TunnelCfg {
    fn from(config: &InstanceCfg) -> TunnelCfg {
        TunnelCfg {
            setup_timeout: config.setup_timeout(),
            retry_interval: config.setup_retry_interval(),
            retry_limit: config.setup_retry_count,
            resolver_retry_interval: config.resolver_retry_interval(),
            adaptivity_interval: config.adaptivity_interval(),
        }
    }
}

// ===== impl Tunnel =====

impl Tunnel {
    pub(crate) fn new(
        key: TunnelKey,
        required_bw: Bandwidth,
        attrs: LspAttrs,
        style: ResvStyle,
        cfg: TunnelCfg,
    ) -> Tunnel {
        Debug::TunnelCreate(&key).log();

        Tunnel {
            key,
            name: None,
            role: None,
            state: fsm::State::PathResolution,
            required_bw,
            allocated_bw: 0,
            attrs,
            style,
            path: Default::default(),
            exclude: Default::default(),
            avoid: Default::default(),
            working: None,
            reroute_in_progress: false,
            adjustment_required: false,
            lsps: Default::default(),
            retries_left: cfg.retry_limit,
            cfg,
            statistics: TunnelStatistics {
                create_time: Utc::now(),
                last_up_time: None,
                setup_failures: 0,
                reroutes: 0,
            },
            next_lsp_id: 1,
        }
    }

    pub fn working_lsp(&self) -> Option<&Lsp> {
        self.working.and_then(|lsp_id| self.lsps.get(&lsp_id))
    }

    pub fn working_route(&self) -> Option<&LspRoute> {
        self.working_lsp().and_then(|lsp| lsp.route.as_ref())
    }

    pub fn is_up(&self) -> bool {
        self.working_lsp().is_some()
    }

    // Whether the configured path leaves room for the resolver to pick a
    // different one.
    pub fn is_path_flexible(&self) -> bool {
        self.path.is_empty() || self.path.iter().any(|hop| hop.loose)
    }

    pub(crate) fn owner_key(&self, lsp_id: u16) -> OwnerKey {
        OwnerKey::new(
            &LspKey {
                tunnel: self.key,
                lsp_id,
            },
            self.style,
        )
    }

    // Creates a new candidate LSP carrying the tunnel's current parameters.
    pub(crate) fn add_lsp(&mut self) -> LspKey {
        let lsp_id = self.next_lsp_id();
        let key = LspKey {
            tunnel: self.key,
            lsp_id,
        };
        let lsp = Lsp {
            key,
            owner: self.owner_key(lsp_id),
            bw: self.required_bw,
            attrs: self.attrs,
            route: None,
            labels: Default::default(),
            state: LspState::Resolving,
            exclude: self.exclude.clone(),
            avoid: self.avoid.clone(),
        };
        Debug::LspCreate(&key, lsp.bw).log();
        self.lsps.insert(lsp_id, lsp);
        key
    }

    pub(crate) fn remove_lsp(&mut self, lsp_id: u16) -> Option<Lsp> {
        let lsp = self.lsps.remove(&lsp_id)?;
        Debug::LspDelete(&lsp.key).log();
        if self.working == Some(lsp_id) {
            self.working = None;
            self.allocated_bw = 0;
        }
        Some(lsp)
    }

    // Another live candidate interchangeable with the given one.
    pub(crate) fn duplicate_of(&self, lsp_id: u16) -> Option<u16> {
        let lsp = self.lsps.get(&lsp_id)?;
        let route = lsp.route.as_ref()?;
        self.lsps
            .values()
            .filter(|other| other.key.lsp_id != lsp_id)
            .filter(|other| other.attrs == lsp.attrs && other.bw == lsp.bw)
            .find(|other| {
                other
                    .route
                    .as_ref()
                    .is_some_and(|other_route| route.same_path(other_route))
            })
            .map(|other| other.key.lsp_id)
    }

    // Picks the established candidate whose bandwidth is closest to the
    // requirement.
    //
    // Ties go to the lower LSP ID when the requirement is exceeded and to the
    // higher LSP ID otherwise, so an exact match favors the newest path.
    pub(crate) fn closest_lsp(&self) -> Option<u16> {
        let required = self.required_bw;
        self.lsps
            .values()
            .filter(|lsp| lsp.is_up())
            .min_by(|a, b| {
                let dist_a = a.bw.abs_diff(required);
                let dist_b = b.bw.abs_diff(required);
                dist_a
                    .cmp(&dist_b)
                    .then_with(|| (b.bw >= required).cmp(&(a.bw >= required)))
                    .then_with(|| {
                        if a.bw > required {
                            a.key.lsp_id.cmp(&b.key.lsp_id)
                        } else {
                            b.key.lsp_id.cmp(&a.key.lsp_id)
                        }
                    })
            })
            .map(|lsp| lsp.key.lsp_id)
    }

    // Owner key the next candidate will reserve bandwidth under.
    pub(crate) fn next_owner_key(&self) -> OwnerKey {
        self.owner_key(self.peek_lsp_id())
    }

    fn peek_lsp_id(&self) -> u16 {
        let mut lsp_id = self.next_lsp_id;
        while self.lsps.contains_key(&lsp_id) {
            lsp_id = lsp_id.wrapping_add(1).max(1);
        }
        lsp_id
    }

    fn next_lsp_id(&mut self) -> u16 {
        let lsp_id = self.peek_lsp_id();
        self.next_lsp_id = lsp_id.wrapping_add(1).max(1);
        lsp_id
    }

    pub(crate) fn fsm(
        instance: &mut Instance,
        key: &TunnelKey,
        event: fsm::Event,
    ) -> Result<(), Error> {
        let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
            return Err(Error::TunnelNotFound(*key));
        };

        let (new_state, action) = tunnel.fsm_event(event)?;
        if new_state != tunnel.state {
            Debug::TunnelFsmTransition(key, &event, &tunnel.state, &new_state)
                .log();
            tunnel.state = new_state;
        }

        match action {
            Some(action) => Tunnel::fsm_action(instance, key, action),
            None => Ok(()),
        }
    }

    fn fsm_event(
        &self,
        event: fsm::Event,
    ) -> Result<(fsm::State, Option<fsm::Action>), Error> {
        use fsm::{Action, Event, State};
        match (self.state, event) {
            // Path requests.
            (
                State::PathResolution | State::Retrying | State::Failed,
                Event::PathRequest,
            ) => Ok((State::PathResolution, Some(Action::Resolve))),
            (State::Established, Event::PathRequest) => {
                Ok((State::Reoptimizing, Some(Action::Resolve)))
            }
            (
                State::SignalingConfirmation
                | State::Reoptimizing
                | State::Rerouting,
                Event::PathRequest,
            ) => Ok((self.state, Some(Action::Resolve))),
            (_, Event::RerouteRequest) => {
                Ok((State::Rerouting, Some(Action::Resolve)))
            }
            (State::Established, Event::AdaptivityTimer) => {
                Ok((State::Reoptimizing, Some(Action::Resolve)))
            }
            (_, Event::AdaptivityTimer) => Ok((self.state, None)),
            // Resolver replies. Signaling of the resolved candidate is up to
            // the caller.
            (State::PathResolution | State::Retrying, Event::PathResolved) => {
                Ok((State::SignalingConfirmation, None))
            }
            (
                State::SignalingConfirmation
                | State::Established
                | State::Reoptimizing
                | State::Rerouting,
                Event::PathResolved,
            ) => Ok((self.state, None)),
            (State::Reoptimizing | State::Rerouting, Event::PathUnchanged)
                if self.is_up() =>
            {
                Ok((State::Established, None))
            }
            (_, Event::PathUnchanged) => Ok((self.state, None)),
            // Signaling outcome.
            (
                State::PathResolution
                | State::SignalingConfirmation
                | State::Established
                | State::Reoptimizing
                | State::Rerouting
                | State::Retrying,
                Event::SignalingUp,
            ) => Ok((State::Established, Some(Action::Reconcile))),
            (_, Event::SetupFailed) if self.is_up() => {
                Ok((State::Established, None))
            }
            (
                State::PathResolution
                | State::SignalingConfirmation
                | State::Reoptimizing
                | State::Rerouting,
                Event::SetupFailed,
            ) => Ok((State::Retrying, Some(Action::ScheduleRetry))),
            (State::Retrying | State::Failed, Event::SetupFailed) => {
                Ok((self.state, None))
            }
            (State::Retrying, Event::RetryTimer) => {
                Ok((State::PathResolution, Some(Action::Resolve)))
            }
            (State::Retrying, Event::RetryExhausted) => {
                Ok((State::Failed, Some(Action::GiveUp)))
            }
            // Working LSP loss.
            (
                State::Established | State::Reoptimizing | State::Rerouting,
                Event::WorkingLspFailed,
            ) => Ok((State::Rerouting, Some(Action::Recover))),
            _ => Err(Error::TunnelFsmUnexpectedEvent(
                self.key, self.state, event,
            )),
        }
    }

    fn fsm_action(
        instance: &mut Instance,
        key: &TunnelKey,
        action: fsm::Action,
    ) -> Result<(), Error> {
        match action {
            fsm::Action::Resolve => lifecycle::resolve_new_lsp(instance, key),
            fsm::Action::Reconcile => lifecycle::reconcile(instance, key),
            fsm::Action::ScheduleRetry => {
                lifecycle::schedule_retry(instance, key)
            }
            fsm::Action::Recover => lifecycle::recover(instance, key),
            fsm::Action::GiveUp => {
                lifecycle::give_up(instance, key);
                Ok(())
            }
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;

    fn tunnel(style: ResvStyle) -> Tunnel {
        let key = TunnelKey {
            dst: ip4!("2.2.2.2"),
            tunnel_id: 1,
            src: ip4!("1.1.1.1"),
        };
        let cfg = TunnelCfg::from(&InstanceCfg::default());
        Tunnel::new(key, 0, LspAttrs::new(3, 3), style, cfg)
    }

    // Adds an established candidate of the given bandwidth.
    fn add_up_lsp(tunnel: &mut Tunnel, bw: Bandwidth) -> u16 {
        tunnel.required_bw = bw;
        let key = tunnel.add_lsp();
        let lsp = tunnel.lsps.get_mut(&key.lsp_id).unwrap();
        lsp.state = LspState::Up;
        key.lsp_id
    }

    #[test]
    fn closest_bandwidth() {
        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        add_up_lsp(&mut tunnel, 80);
        let exact = add_up_lsp(&mut tunnel, 100);
        add_up_lsp(&mut tunnel, 120);

        tunnel.required_bw = 100;
        assert_eq!(tunnel.closest_lsp(), Some(exact));
    }

    #[test]
    fn closest_bandwidth_ties() {
        // Equal distance, the larger candidate wins.
        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        add_up_lsp(&mut tunnel, 90);
        let over = add_up_lsp(&mut tunnel, 110);
        tunnel.required_bw = 100;
        assert_eq!(tunnel.closest_lsp(), Some(over));

        // Exact matches favor the newest candidate.
        let mut tunnel = self::tunnel(ResvStyle::SharedExplicit);
        add_up_lsp(&mut tunnel, 100);
        let newest = add_up_lsp(&mut tunnel, 100);
        assert_eq!(tunnel.closest_lsp(), Some(newest));

        // Exceeding candidates favor the oldest one.
        let mut tunnel = self::tunnel(ResvStyle::SharedExplicit);
        let oldest = add_up_lsp(&mut tunnel, 120);
        add_up_lsp(&mut tunnel, 120);
        tunnel.required_bw = 100;
        assert_eq!(tunnel.closest_lsp(), Some(oldest));
    }

    #[test]
    fn closest_ignores_pending_candidates() {
        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        let up = add_up_lsp(&mut tunnel, 80);
        tunnel.required_bw = 100;
        tunnel.add_lsp();

        assert_eq!(tunnel.closest_lsp(), Some(up));
    }

    #[test]
    fn owner_keys_follow_style() {
        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        let first = tunnel.add_lsp();
        let second = tunnel.add_lsp();
        let owner = tunnel.lsps[&first.lsp_id].owner;
        assert_eq!(tunnel.lsps[&second.lsp_id].owner, owner);
        assert_eq!(tunnel.next_owner_key(), owner);

        let mut tunnel = self::tunnel(ResvStyle::FixedFilter);
        let first = tunnel.add_lsp();
        let second = tunnel.add_lsp();
        let owner = tunnel.lsps[&first.lsp_id].owner;
        assert_ne!(tunnel.lsps[&second.lsp_id].owner, owner);
        assert_eq!(tunnel.next_owner_key().lsp_id, Some(3));
    }

    #[test]
    fn duplicate_paths() {
        let first_hop = FirstHop {
            te_link: TeLinkId(1),
            out_if: 10,
        };
        let hop = |node| Hop {
            node,
            addr: node,
            loose: false,
        };
        let route = |hops: Vec<Hop>| LspRoute::Explicit { hops, first_hop };

        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        let a = tunnel.add_lsp().lsp_id;
        let b = tunnel.add_lsp().lsp_id;
        let c = tunnel.add_lsp().lsp_id;
        let path = vec![hop(ip4!("10.0.0.2")), hop(ip4!("2.2.2.2"))];
        let detour = vec![hop(ip4!("10.0.0.3")), hop(ip4!("2.2.2.2"))];
        tunnel.lsps.get_mut(&a).unwrap().route = Some(route(path.clone()));
        tunnel.lsps.get_mut(&b).unwrap().route = Some(route(detour.clone()));
        tunnel.lsps.get_mut(&c).unwrap().route = Some(route(path.clone()));

        assert_eq!(tunnel.duplicate_of(c), Some(a));
        assert_eq!(tunnel.duplicate_of(b), None);
        assert_eq!(route(detour).shared_nodes(&path), 1);
    }

    #[test]
    fn fsm_transitions() {
        use fsm::{Action, Event, State};

        let mut tunnel = tunnel(ResvStyle::SharedExplicit);
        assert_eq!(
            tunnel.fsm_event(Event::PathRequest).unwrap(),
            (State::PathResolution, Some(Action::Resolve))
        );
        assert_eq!(
            tunnel.fsm_event(Event::SetupFailed).unwrap(),
            (State::Retrying, Some(Action::ScheduleRetry))
        );

        tunnel.state = State::Retrying;
        assert_eq!(
            tunnel.fsm_event(Event::RetryTimer).unwrap(),
            (State::PathResolution, Some(Action::Resolve))
        );
        assert_eq!(
            tunnel.fsm_event(Event::RetryExhausted).unwrap(),
            (State::Failed, Some(Action::GiveUp))
        );

        tunnel.state = State::Failed;
        assert!(matches!(
            tunnel.fsm_event(Event::WorkingLspFailed),
            Err(Error::TunnelFsmUnexpectedEvent(..))
        ));
    }

    #[test]
    fn invalid_priorities() {
        assert!(LspAttrs::new(3, 3).validate().is_ok());
        assert!(matches!(
            LspAttrs::new(8, 3).validate(),
            Err(Error::InvalidPriority(8))
        ));
        assert!(matches!(
            LspAttrs::new(2, 5).validate(),
            Err(Error::InvalidPriorities(2, 5))
        ));
    }
}
