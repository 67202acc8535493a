//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use chrono::Utc;
use itertools::Itertools;

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Instance;
use crate::ledger::{OwnerKey, ResvStyle};
use crate::lsp::{UserLsp, UserLspCfg};
use crate::tasks::messages::input::{LspRequestMsg, PathResult, PreemptedMsg};
use crate::tasks::messages::output::{
    BwHint, ResolverRequestMsg, SetupFailReason, SignalingCmdMsg,
    UserLspEvent, UserLspNotifMsg,
};
use crate::te::{Bandwidth, IfIndex};
use crate::timers::TimerKey;
use crate::tunnel::{
    Hop, Label, Lsp, LspKey, LspRoute, LspState, PathRole, Tunnel, TunnelCfg,
    TunnelKey, fsm,
};

// ===== tunnel requests =====

// Creates a tunnel, or updates an existing one, according to an LSP request.
pub(crate) fn lsp_request(
    instance: &mut Instance,
    req: LspRequestMsg,
) -> Result<TunnelKey, Error> {
    req.attrs.validate()?;

    if let Some(tunnel_id) = req.tunnel_id {
        let key = TunnelKey {
            dst: req.dst,
            tunnel_id,
            src: req.src,
        };
        if instance.tunnels.get_by_key(&key).is_some() {
            update_tunnel(instance, &key, req)?;
            return Ok(key);
        }
    }

    let cfg = TunnelCfg::from(&instance.config);
    let tunnel = new_tunnel(instance, &req, cfg)?;
    start_tunnel(instance, tunnel)
}

fn new_tunnel(
    instance: &Instance,
    req: &LspRequestMsg,
    cfg: TunnelCfg,
) -> Result<Tunnel, Error> {
    let tunnel_id = match req.tunnel_id {
        Some(tunnel_id) => tunnel_id,
        None => instance.tunnels.alloc_tunnel_id(
            req.dst,
            req.src,
            instance.config.tunnel_id_range(),
        )?,
    };
    let key = TunnelKey {
        dst: req.dst,
        tunnel_id,
        src: req.src,
    };
    let style = req.style.unwrap_or(instance.config.resv_style);

    let mut tunnel = Tunnel::new(key, req.bw, req.attrs, style, cfg);
    tunnel.path = req.path.clone().unwrap_or_default();
    tunnel.exclude = req.exclude.clone();
    Ok(tunnel)
}

fn start_tunnel(
    instance: &mut Instance,
    tunnel: Tunnel,
) -> Result<TunnelKey, Error> {
    let key = tunnel.key;
    instance.tunnels.insert(tunnel);
    Tunnel::fsm(instance, &key, fsm::Event::PathRequest)?;
    Ok(key)
}

fn update_tunnel(
    instance: &mut Instance,
    key: &TunnelKey,
    req: LspRequestMsg,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let attrs_changed = tunnel.attrs != req.attrs;
    tunnel.attrs = req.attrs;

    // A new hop list is a reroute request.
    if let Some(path) = req.path {
        tunnel.path = path;
        tunnel.exclude = req.exclude;
        tunnel.required_bw = req.bw;
        tunnel.reroute_in_progress = true;
        tunnel.statistics.reroutes += 1;
        return Tunnel::fsm(instance, key, fsm::Event::RerouteRequest);
    }

    let old_bw = tunnel.required_bw;
    tunnel.required_bw = req.bw;
    tunnel.exclude.extend(req.exclude);
    if !req.force_resolve && !attrs_changed && req.bw == old_bw {
        return Ok(());
    }
    if req.force_resolve || attrs_changed || !tunnel.is_up() {
        return Tunnel::fsm(instance, key, fsm::Event::PathRequest);
    }

    match req.bw.cmp(&old_bw) {
        Ordering::Less => decrease_bandwidth(instance, key),
        Ordering::Greater => increase_bandwidth(instance, key),
        Ordering::Equal => Ok(()),
    }
}

// Shrinks the working LSP in place when it holds more than required.
fn decrease_bandwidth(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let required_bw = tunnel.required_bw;
    let Some(lsp) = tunnel.working.and_then(|id| tunnel.lsps.get_mut(&id))
    else {
        return Ok(());
    };
    // Larger candidates in flight will be reconciled once they are up.
    if lsp.bw <= required_bw {
        return Ok(());
    }
    lsp.bw = required_bw;
    let (lsp_key, owner, attrs) = (lsp.key, lsp.owner, lsp.attrs);
    let route = lsp.route.clone();
    tunnel.allocated_bw = required_bw;

    if let Some(first_hop) = route.as_ref().and_then(LspRoute::first_hop) {
        let (ledger, mut cxt) = instance.ledger_cxt();
        ledger.commit(
            &mut cxt,
            &owner,
            first_hop.te_link,
            first_hop.out_if,
            required_bw,
            attrs.hold_prio,
            attrs.setup_prio,
        )?;
    }
    if let Some(route) = route {
        let msg = SignalingCmdMsg::PathSend {
            lsp: lsp_key,
            route,
            bw: required_bw,
            attrs,
        };
        send_signaling(instance, msg);
    }
    notify(instance, key, UserLspEvent::BandwidthChanged { bw: required_bw });
    Ok(())
}

// Grows the tunnel over its working path when every hop can absorb the
// extra bandwidth, or looks for a new path otherwise.
fn increase_bandwidth(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    if !working_path_fits(instance, tunnel) {
        return Tunnel::fsm(instance, key, fsm::Event::PathRequest);
    }

    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let route = tunnel.working_route().cloned();
    let lsp_key = tunnel.add_lsp();
    if let Some(lsp) = tunnel.lsps.get_mut(&lsp_key.lsp_id) {
        lsp.route = route;
    }
    admit_and_signal(instance, &lsp_key)
}

fn working_path_fits(instance: &Instance, tunnel: &Tunnel) -> bool {
    let Some(lsp) = tunnel.working_lsp() else {
        return false;
    };
    let Some(route) = &lsp.route else {
        return false;
    };
    let Some(first_hop) = route.first_hop() else {
        return false;
    };

    // Local interface.
    let owner = tunnel.next_owner_key();
    if instance
        .ledger
        .calc_actual_allocation(
            &instance.te_db,
            &owner,
            first_hop.out_if,
            tunnel.required_bw,
            tunnel.attrs.setup_prio,
            tunnel.attrs.hold_prio,
        )
        .is_err()
    {
        return false;
    }

    // Downstream links, as advertised. Under shared styles only the
    // difference is reserved again.
    let extra = match tunnel.style {
        ResvStyle::SharedExplicit => tunnel.required_bw.saturating_sub(lsp.bw),
        ResvStyle::FixedFilter => tunnel.required_bw,
    };
    let setup = tunnel.attrs.setup_prio as usize;
    route.hops().iter().skip(1).all(|hop| {
        instance
            .te_db
            .te_link_by_addr(hop.addr)
            .and_then(|te_link| instance.te_db.max_reservable(te_link.id))
            .is_some_and(|max_reservable| max_reservable[setup] >= extra)
    })
}

// Tears down a tunnel along with all its candidates.
pub(crate) fn delete_tunnel(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (tunnel_idx, tunnel) = instance
        .tunnels
        .get_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let lsp_ids = teardown_order(tunnel);

    for lsp_id in lsp_ids {
        drop_candidate(instance, key, lsp_id, true)?;
    }
    instance.timers.stop(&TimerKey::SetupRetry(*key));
    instance.timers.stop(&TimerKey::Adaptivity(*key));
    instance.tunnels.delete(tunnel_idx);
    Debug::TunnelDelete(key).log();
    Ok(())
}

// ===== path resolution =====

// Creates a new candidate and asks the resolver for a path.
pub(crate) fn resolve_new_lsp(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let lsp_key = tunnel.add_lsp();
    send_resolver_request(instance, &lsp_key)
}

fn send_resolver_request(
    instance: &Instance,
    lsp_key: &LspKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_by_key(&lsp_key.tunnel)
        .ok_or(Error::TunnelNotFound(lsp_key.tunnel))?;
    let lsp = tunnel
        .lsps
        .get(&lsp_key.lsp_id)
        .ok_or(Error::LspNotFound(*lsp_key))?;

    let hints = match (tunnel.style, tunnel.working_route()) {
        (ResvStyle::SharedExplicit, Some(route)) => route
            .hops()
            .iter()
            .map(|hop| BwHint {
                addr: hop.addr,
                bw: tunnel.allocated_bw,
            })
            .collect(),
        _ => vec![],
    };
    let msg = ResolverRequestMsg {
        lsp: *lsp_key,
        owner: lsp.owner,
        dst: lsp_key.tunnel.dst,
        bw: lsp.bw,
        attrs: lsp.attrs,
        path: tunnel.path.clone(),
        avoid: lsp.avoid.iter().copied().collect(),
        exclude: lsp.exclude.iter().copied().collect(),
        hints,
    };
    Debug::PathRequest(&msg).log();
    let _ = instance.tx.resolver.send(msg);
    Ok(())
}

// Asks the resolver again about a candidate whose query was left pending.
pub(crate) fn resolver_retry(
    instance: &mut Instance,
    lsp_key: &LspKey,
) -> Result<(), Error> {
    let resolving =
        instance
            .tunnels
            .get_by_key(&lsp_key.tunnel)
            .is_some_and(|(_, tunnel)| {
                tunnel.lsps.get(&lsp_key.lsp_id).is_some_and(|lsp| {
                    lsp.state == LspState::Resolving
                })
            });
    if !resolving {
        return Ok(());
    }
    send_resolver_request(instance, lsp_key)
}

pub(crate) fn path_reply(
    instance: &mut Instance,
    lsp_key: &LspKey,
    result: PathResult,
) -> Result<(), Error> {
    Debug::PathReply(lsp_key, &result).log();

    let Some((_, tunnel)) = instance.tunnels.get_by_key(&lsp_key.tunnel)
    else {
        Debug::NoMatchingTunnel(&lsp_key.tunnel).log();
        return Ok(());
    };
    // Replies about candidates that moved on are stale.
    if !tunnel
        .lsps
        .get(&lsp_key.lsp_id)
        .is_some_and(|lsp| lsp.state == LspState::Resolving)
    {
        return Ok(());
    }
    let retry_interval = tunnel.cfg.resolver_retry_interval;
    instance.timers.stop(&TimerKey::ResolverRetry(*lsp_key));

    match result {
        PathResult::Pending => {
            instance
                .timers
                .start(TimerKey::ResolverRetry(*lsp_key), retry_interval);
            Ok(())
        }
        PathResult::Unreachable => {
            Error::RouteUnreachable(*lsp_key).log();
            setup_failed(instance, lsp_key, SetupFailReason::Unreachable, None)
        }
        PathResult::AdmissionDenied => setup_failed(
            instance,
            lsp_key,
            SetupFailReason::AdmissionDenied,
            None,
        ),
        PathResult::Resolved(route) => path_resolved(instance, lsp_key, route),
    }
}

fn path_resolved(
    instance: &mut Instance,
    lsp_key: &LspKey,
    route: LspRoute,
) -> Result<(), Error> {
    let key = &lsp_key.tunnel;
    let lsp_id = lsp_key.lsp_id;
    let primary_path = primary_path_of(instance, key);
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let lsp = tunnel
        .lsps
        .get_mut(&lsp_id)
        .ok_or(Error::LspNotFound(*lsp_key))?;
    lsp.route = Some(route.clone());
    let bw = lsp.bw;

    // Another candidate already follows this path.
    if let Some(existing) = tunnel.duplicate_of(lsp_id) {
        Debug::LspDuplicate(lsp_key, existing).log();
        let working = tunnel.working == Some(existing);
        drop_candidate(instance, key, lsp_id, false)?;
        if working {
            return path_unchanged(instance, key);
        }
        return Ok(());
    }

    // Secondary paths keep whichever candidate shares the fewest nodes with
    // the primary path.
    let rival = primary_path.and_then(|primary_path| {
        rival_candidate(tunnel, lsp_id).map(|rival| (primary_path, rival))
    });
    if let Some((primary_path, (rival, rival_route))) = rival {
        let score = route.shared_nodes(&primary_path);
        let rival_score = rival_route.shared_nodes(&primary_path);
        let loser = if score >= rival_score { lsp_id } else { rival };
        drop_candidate(instance, key, loser, true)?;
        if loser == lsp_id {
            return Ok(());
        }
    }

    Tunnel::fsm(instance, key, fsm::Event::PathResolved)?;
    match route {
        LspRoute::LocalEgress => lsp_up(instance, lsp_key, bw, vec![]),
        _ => admit_and_signal(instance, lsp_key),
    }
}

// In-flight candidate interchangeable with the given one, but following a
// different path.
fn rival_candidate(tunnel: &Tunnel, lsp_id: u16) -> Option<(u16, LspRoute)> {
    let lsp = tunnel.lsps.get(&lsp_id)?;
    tunnel
        .lsps
        .values()
        .filter(|other| other.key.lsp_id != lsp_id)
        .filter(|other| other.state == LspState::Signaling)
        .filter(|other| other.attrs == lsp.attrs && other.bw == lsp.bw)
        .find_map(|other| {
            other
                .route
                .clone()
                .map(|route| (other.key.lsp_id, route))
        })
}

fn path_unchanged(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    if let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) {
        tunnel.reroute_in_progress = false;
    }
    Tunnel::fsm(instance, key, fsm::Event::PathUnchanged)?;
    finish_adjustment(instance, key)?;
    rearm_adaptivity(instance, key);
    Ok(())
}

// ===== signaling =====

// Reserves bandwidth on the first hop of a resolved candidate and signals
// it.
fn admit_and_signal(
    instance: &mut Instance,
    lsp_key: &LspKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_by_key(&lsp_key.tunnel)
        .ok_or(Error::TunnelNotFound(lsp_key.tunnel))?;
    let setup_timeout = tunnel.cfg.setup_timeout;
    let lsp = tunnel
        .lsps
        .get(&lsp_key.lsp_id)
        .ok_or(Error::LspNotFound(*lsp_key))?;
    let route = lsp.route.clone().ok_or(Error::RouteUnreachable(*lsp_key))?;
    let (owner, bw, attrs) = (lsp.owner, lsp.bw, lsp.attrs);

    // Carrying tunnels reserve on their own.
    if let Some(first_hop) = route.first_hop() {
        let admission = instance.ledger.calc_actual_allocation(
            &instance.te_db,
            &owner,
            first_hop.out_if,
            bw,
            attrs.setup_prio,
            attrs.hold_prio,
        );
        let reservation = admission.and_then(|_| {
            let (ledger, mut cxt) = instance.ledger_cxt();
            ledger.provisional_reserve(
                &mut cxt,
                &owner,
                first_hop.te_link,
                first_hop.out_if,
                bw,
                attrs.hold_prio,
            )
        });
        if let Err(error) = reservation {
            error.log();
            return setup_failed(
                instance,
                lsp_key,
                SetupFailReason::AdmissionDenied,
                None,
            );
        }
    }

    if let Some(lsp) = instance
        .tunnels
        .get_mut_by_key(&lsp_key.tunnel)
        .and_then(|(_, tunnel)| tunnel.lsps.get_mut(&lsp_key.lsp_id))
    {
        lsp.state = LspState::Signaling;
    }
    instance
        .timers
        .start(TimerKey::SetupTimeout(*lsp_key), setup_timeout);
    let msg = SignalingCmdMsg::PathSend {
        lsp: *lsp_key,
        route,
        bw,
        attrs,
    };
    send_signaling(instance, msg);
    Ok(())
}

// Commits the reservation of a candidate whose setup was confirmed.
pub(crate) fn lsp_up(
    instance: &mut Instance,
    lsp_key: &LspKey,
    bw: Bandwidth,
    labels: Vec<Label>,
) -> Result<(), Error> {
    let key = &lsp_key.tunnel;
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        Debug::NoMatchingTunnel(key).log();
        return Ok(());
    };
    let Some(lsp) = tunnel.lsps.get_mut(&lsp_key.lsp_id) else {
        return Ok(());
    };
    // Refresh of an established LSP.
    if lsp.is_up() {
        lsp.labels = labels;
        return Ok(());
    }
    instance.timers.stop(&TimerKey::SetupTimeout(*lsp_key));

    let (owner, attrs) = (lsp.owner, lsp.attrs);
    if let Some(first_hop) = lsp.route.as_ref().and_then(LspRoute::first_hop) {
        // Shared reservations cover every established candidate.
        let (established, _) =
            owner_demand(tunnel, &owner, first_hop.out_if).unwrap_or_default();
        let (ledger, mut cxt) = instance.ledger_cxt();
        if let Err(error) = ledger.commit(
            &mut cxt,
            &owner,
            first_hop.te_link,
            first_hop.out_if,
            bw.max(established),
            attrs.hold_prio,
            attrs.setup_prio,
        ) {
            error.log();
            return setup_failed(
                instance,
                lsp_key,
                SetupFailReason::AdmissionDenied,
                None,
            );
        }
    }

    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let lsp = tunnel
        .lsps
        .get_mut(&lsp_key.lsp_id)
        .ok_or(Error::LspNotFound(*lsp_key))?;
    lsp.state = LspState::Up;
    lsp.labels = labels;
    tunnel.statistics.last_up_time = Some(Utc::now());
    Debug::LspUp(lsp_key, bw).log();

    Tunnel::fsm(instance, key, fsm::Event::SignalingUp)
}

// Selects the working LSP among the established candidates and tears down
// the others.
pub(crate) fn reconcile(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let Some(chosen) = tunnel.closest_lsp() else {
        return Ok(());
    };
    let previous = tunnel.working_lsp().map(|lsp| (lsp.key.lsp_id, lsp.bw));
    let chosen_bw = tunnel
        .lsps
        .get(&chosen)
        .map(|lsp| lsp.bw)
        .unwrap_or_default();
    let required_bw = tunnel.required_bw;
    let victims = tunnel
        .lsps
        .values()
        .filter(|lsp| lsp.key.lsp_id != chosen)
        .filter(|lsp| lsp.is_up() || lsp.bw != required_bw)
        .map(|lsp| lsp.key.lsp_id)
        .collect_vec();

    tunnel.working = Some(chosen);
    tunnel.allocated_bw = chosen_bw;
    tunnel.retries_left = tunnel.cfg.retry_limit;
    tunnel.reroute_in_progress = false;
    instance.timers.stop(&TimerKey::SetupRetry(*key));

    for lsp_id in victims {
        drop_candidate(instance, key, lsp_id, true)?;
    }

    let event = match previous {
        Some((lsp_id, _)) if lsp_id == chosen => None,
        Some((_, bw)) if bw != chosen_bw => {
            Some(UserLspEvent::BandwidthChanged { bw: chosen_bw })
        }
        _ => Some(UserLspEvent::Up {
            lsp_id: chosen,
            bw: chosen_bw,
        }),
    };
    if let Some(event) = event {
        notify(instance, key, event);
    }

    user_lsp_tunnel_up(instance, key)?;
    finish_adjustment(instance, key)?;
    rearm_adaptivity(instance, key);
    Ok(())
}

// Handles a candidate that could not be set up.
pub(crate) fn setup_failed(
    instance: &mut Instance,
    lsp_key: &LspKey,
    reason: SetupFailReason,
    node: Option<Ipv4Addr>,
) -> Result<(), Error> {
    let key = &lsp_key.tunnel;
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        Debug::NoMatchingTunnel(key).log();
        return Ok(());
    };
    if !tunnel.lsps.contains_key(&lsp_key.lsp_id) {
        return Ok(());
    }
    Debug::LspFailed(lsp_key, node).log();
    if let Some(node) = node {
        tunnel.exclude.insert(node);
    }
    tunnel.statistics.setup_failures += 1;

    // The transport already cleaned up after its own failures.
    let tear = !matches!(reason, SetupFailReason::Signaling(_));
    drop_candidate(instance, key, lsp_key.lsp_id, tear)?;
    notify(instance, key, UserLspEvent::SetupFailed(reason));
    Tunnel::fsm(instance, key, fsm::Event::SetupFailed)
}

// Arms the setup retry timer while retries are left.
pub(crate) fn schedule_retry(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_mut_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    if tunnel.retries_left > 0 {
        tunnel.retries_left -= 1;
        Debug::RetryScheduled(key, tunnel.retries_left).log();
        instance
            .timers
            .start(TimerKey::SetupRetry(*key), tunnel.cfg.retry_interval);
        return Ok(());
    }

    instance.timers.stop(&TimerKey::SetupRetry(*key));
    Error::RetryLimitExceeded(*key).log();
    notify(instance, key, UserLspEvent::RetryLimitExceeded);
    Tunnel::fsm(instance, key, fsm::Event::RetryExhausted)
}

// Abandons every candidate still being set up.
pub(crate) fn give_up(instance: &mut Instance, key: &TunnelKey) {
    let Some((_, tunnel)) = instance.tunnels.get_by_key(key) else {
        return;
    };
    let pending = tunnel
        .lsps
        .values()
        .filter(|lsp| !lsp.is_up())
        .map(|lsp| lsp.key.lsp_id)
        .collect_vec();

    for lsp_id in pending {
        if let Err(error) = drop_candidate(instance, key, lsp_id, true) {
            error.log();
        }
    }
    instance.timers.stop(&TimerKey::SetupRetry(*key));
}

// ===== failures =====

// Handles the loss of a candidate, either while being set up or once
// established.
pub(crate) fn lsp_failed(
    instance: &mut Instance,
    lsp_key: &LspKey,
    reason: SetupFailReason,
    node: Option<Ipv4Addr>,
) -> Result<(), Error> {
    let key = &lsp_key.tunnel;
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        Debug::NoMatchingTunnel(key).log();
        return Ok(());
    };
    let Some(lsp) = tunnel.lsps.get(&lsp_key.lsp_id) else {
        return Ok(());
    };
    if !lsp.is_up() {
        return setup_failed(instance, lsp_key, reason, node);
    }
    let tear = !matches!(reason, SetupFailReason::Signaling(_));
    if tunnel.working != Some(lsp_key.lsp_id) {
        drop_candidate(instance, key, lsp_key.lsp_id, tear)?;
        return Ok(());
    }

    Debug::LspFailed(lsp_key, node).log();
    if let Some(node) = node {
        tunnel.exclude.insert(node);
    }
    tunnel.reroute_in_progress = true;

    // Candidates sharing the lost reservation go along with it.
    let owner = lsp.owner;
    let sharing = teardown_order(tunnel)
        .into_iter()
        .filter(|lsp_id| {
            tunnel
                .lsps
                .get(lsp_id)
                .is_some_and(|other| other.owner == owner)
        })
        .collect_vec();
    for lsp_id in sharing {
        let tear = lsp_id != lsp_key.lsp_id || tear;
        drop_candidate(instance, key, lsp_id, tear)?;
    }

    let event = match reason {
        SetupFailReason::Preempted => UserLspEvent::Preempted,
        _ => UserLspEvent::Down,
    };
    notify(instance, key, event);
    Tunnel::fsm(instance, key, fsm::Event::WorkingLspFailed)
}

// Hands the candidates whose reservation was preempted over to failure
// handling.
pub(crate) fn preempted(
    instance: &mut Instance,
    msg: PreemptedMsg,
) -> Result<(), Error> {
    let key = msg.owner.tunnel();
    let Some((_, tunnel)) = instance.tunnels.get_by_key(&key) else {
        Debug::NoMatchingTunnel(&key).log();
        return Ok(());
    };
    let victims = tunnel
        .lsps
        .values()
        .filter(|lsp| lsp.owner == msg.owner)
        .filter(|lsp| {
            lsp.route
                .as_ref()
                .and_then(LspRoute::first_hop)
                .is_some_and(|first_hop| first_hop.out_if == msg.out_if)
        })
        .map(|lsp| lsp.key)
        .collect_vec();

    for lsp_key in victims {
        lsp_failed(instance, &lsp_key, SetupFailReason::Preempted, None)?;
    }
    Ok(())
}

// Restores service after the working LSP was lost.
//
// A secondary path that is already up takes over right away. Otherwise the
// next untried secondary path is set up, and as a last resort the tunnel
// looks for a new path avoiding the failure.
pub(crate) fn recover(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let (_, tunnel) = instance
        .tunnels
        .get_by_key(key)
        .ok_or(Error::TunnelNotFound(*key))?;
    let user = tunnel.name.clone().zip(tunnel.role);

    match user {
        Some((name, PathRole::Primary)) => {
            if let Some(secondary) = standby_secondary(instance, &name) {
                let event = UserLspEvent::SwitchedToSecondary {
                    from: *key,
                    to: secondary,
                };
                switch_active(instance, &name, secondary, event);
                return Tunnel::fsm(instance, key, fsm::Event::SetupFailed);
            }
            if let Some(index) = instance
                .user_lsps
                .get(&name)
                .and_then(UserLsp::next_untried_secondary)
            {
                create_secondary(instance, &name, index)?;
                return Tunnel::fsm(instance, key, fsm::Event::SetupFailed);
            }
        }
        Some((name, PathRole::Secondary { .. })) => {
            let primary = instance
                .user_lsps
                .get(&name)
                .filter(|user_lsp| user_lsp.active == *key)
                .map(|user_lsp| user_lsp.primary)
                .filter(|primary| tunnel_is_up(instance, primary));
            if let Some(primary) = primary {
                let event = UserLspEvent::SwitchedToPrimary {
                    from: *key,
                    to: primary,
                };
                switch_active(instance, &name, primary, event);
            }
        }
        None => (),
    }

    resolve_new_lsp(instance, key)
}

// ===== user LSPs =====

pub(crate) fn user_lsp_create(
    instance: &mut Instance,
    cfg: UserLspCfg,
) -> Result<(), Error> {
    if instance.user_lsps.contains_key(&cfg.name) {
        return Err(Error::UserLspExists(cfg.name));
    }
    cfg.attrs.validate()?;

    let name = cfg.name.clone();
    let req = tunnel_request(&cfg, PathRole::Primary, None);
    let mut tunnel =
        new_tunnel(instance, &req, cfg.tunnel_cfg(&instance.config))?;
    tunnel.name = Some(name.clone());
    tunnel.role = Some(PathRole::Primary);
    let primary = tunnel.key;
    let hot_standby = cfg
        .secondaries
        .iter()
        .positions(|secondary| secondary.hot_standby)
        .collect_vec();
    let secondaries = vec![None; cfg.secondaries.len()];
    instance
        .user_lsps
        .insert(name.clone(), UserLsp::new(cfg, primary, secondaries, primary));
    Debug::UserLspCreate(&name).log();

    start_tunnel(instance, tunnel)?;
    for index in hot_standby {
        create_secondary(instance, &name, index)?;
    }
    Ok(())
}

pub(crate) fn user_lsp_update(
    instance: &mut Instance,
    cfg: UserLspCfg,
) -> Result<(), Error> {
    cfg.attrs.validate()?;
    let name = cfg.name.clone();
    let user_lsp = instance
        .user_lsps
        .get_mut(&name)
        .ok_or_else(|| Error::UserLspNotFound(name.clone()))?;
    let old = std::mem::replace(&mut user_lsp.cfg, cfg.clone());
    let primary = user_lsp.primary;
    let tunnels = user_lsp.tunnels().collect_vec();
    Debug::UserLspUpdate(&name).log();

    // Timer and retry overrides.
    let tunnel_cfg = cfg.tunnel_cfg(&instance.config);
    for key in &tunnels {
        if let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) {
            tunnel.cfg = tunnel_cfg.clone();
        }
    }

    // A new primary path reroutes the primary tunnel, bandwidth and
    // attribute changes apply to every tunnel.
    let path_changed = old.primary != cfg.primary;
    let params_changed = old.bw != cfg.bw || old.attrs != cfg.attrs;
    for key in &tunnels {
        let reroute = path_changed && *key == primary;
        if !reroute && !params_changed {
            continue;
        }
        let mut req =
            tunnel_request(&cfg, PathRole::Primary, Some(key.tunnel_id));
        if !reroute {
            req.path = None;
        }
        update_tunnel(instance, key, req)?;
    }

    // Secondary paths are rebuilt from scratch.
    if old.secondaries != cfg.secondaries {
        let Some(user_lsp) = instance.user_lsps.get_mut(&name) else {
            return Ok(());
        };
        let old_secondaries = std::mem::replace(
            &mut user_lsp.secondaries,
            vec![None; cfg.secondaries.len()],
        );
        let active = user_lsp.active;
        for key in old_secondaries.into_iter().flatten() {
            if key == active {
                let event = UserLspEvent::SwitchedToPrimary {
                    from: active,
                    to: primary,
                };
                switch_active(instance, &name, primary, event);
            }
            delete_tunnel(instance, &key)?;
        }
        for (index, secondary) in cfg.secondaries.iter().enumerate() {
            if secondary.hot_standby {
                create_secondary(instance, &name, index)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn user_lsp_delete(
    instance: &mut Instance,
    name: &str,
) -> Result<(), Error> {
    let user_lsp = instance
        .user_lsps
        .remove(name)
        .ok_or_else(|| Error::UserLspNotFound(name.to_owned()))?;

    for key in user_lsp.tunnels() {
        if instance.tunnels.get_by_key(&key).is_some() {
            delete_tunnel(instance, &key)?;
        }
    }
    Debug::UserLspDelete(name).log();
    Ok(())
}

fn tunnel_request(
    cfg: &UserLspCfg,
    role: PathRole,
    tunnel_id: Option<u16>,
) -> LspRequestMsg {
    LspRequestMsg {
        dst: cfg.dst,
        src: cfg.src,
        tunnel_id,
        bw: cfg.bw,
        attrs: cfg.attrs,
        style: cfg.style,
        path: Some(cfg.path(role)),
        exclude: Default::default(),
        force_resolve: false,
    }
}

// Sets up the tunnel of a secondary path, steering it away from the
// primary path and from the nodes the primary path failed at.
fn create_secondary(
    instance: &mut Instance,
    name: &str,
    index: usize,
) -> Result<TunnelKey, Error> {
    let user_lsp = instance
        .user_lsps
        .get(name)
        .ok_or_else(|| Error::UserLspNotFound(name.to_owned()))?;
    let hot_standby = user_lsp
        .cfg
        .secondaries
        .get(index)
        .is_some_and(|secondary| secondary.hot_standby);
    let role = PathRole::Secondary { index, hot_standby };
    let req = tunnel_request(&user_lsp.cfg, role, None);
    let tunnel_cfg = user_lsp.cfg.tunnel_cfg(&instance.config);
    let avoid = primary_path(instance, user_lsp)
        .iter()
        .map(|hop| hop.node)
        .collect::<BTreeSet<_>>();
    let exclude = instance
        .tunnels
        .get_by_key(&user_lsp.primary)
        .map(|(_, primary)| primary.exclude.clone())
        .unwrap_or_default();

    let mut tunnel = new_tunnel(instance, &req, tunnel_cfg)?;
    tunnel.name = Some(name.to_owned());
    tunnel.role = Some(role);
    tunnel.avoid = avoid;
    tunnel.exclude = exclude;
    let key = tunnel.key;
    instance.tunnels.insert(tunnel);
    if let Some(slot) = instance
        .user_lsps
        .get_mut(name)
        .and_then(|user_lsp| user_lsp.secondaries.get_mut(index))
    {
        *slot = Some(key);
    }

    Tunnel::fsm(instance, &key, fsm::Event::PathRequest)?;
    Ok(key)
}

// Updates the user LSP a tunnel belongs to after the tunnel came up.
fn user_lsp_tunnel_up(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let Some((_, tunnel)) = instance.tunnels.get_by_key(key) else {
        return Ok(());
    };
    let Some((name, role)) = tunnel.name.clone().zip(tunnel.role) else {
        return Ok(());
    };
    let Some(user_lsp) = instance.user_lsps.get(&name) else {
        return Ok(());
    };
    let (primary, active) = (user_lsp.primary, user_lsp.active);

    match role {
        PathRole::Primary => {
            if active != *key {
                let event = UserLspEvent::SwitchedToPrimary {
                    from: active,
                    to: *key,
                };
                switch_active(instance, &name, *key, event);
            }
            modify_secondary(instance, &name)
        }
        PathRole::Secondary { .. } => {
            if active == primary && !tunnel_is_up(instance, &primary) {
                let event = UserLspEvent::SwitchedToSecondary {
                    from: primary,
                    to: *key,
                };
                switch_active(instance, &name, *key, event);
            }
            Ok(())
        }
    }
}

// Re-evaluates the hot-standby secondaries of a user LSP after its primary
// path changed.
//
// Secondaries sharing nodes with the new primary path, or that were never
// established, are resolved again. Secondaries in the middle of a reroute
// are adjusted once the reroute completes.
fn modify_secondary(instance: &mut Instance, name: &str) -> Result<(), Error> {
    let Some(user_lsp) = instance.user_lsps.get(name) else {
        return Ok(());
    };
    let primary_path = primary_path(instance, user_lsp);
    let secondaries = user_lsp.hot_standby_secondaries().collect_vec();

    for key in secondaries {
        let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(&key) else {
            continue;
        };
        if tunnel.reroute_in_progress {
            tunnel.adjustment_required = true;
            continue;
        }
        let disjoint = tunnel
            .working_route()
            .is_some_and(|route| route.shared_nodes(&primary_path) == 0);
        let in_flight = tunnel.lsps.values().any(|lsp| !lsp.is_up());
        if disjoint || in_flight {
            continue;
        }

        tunnel.avoid = primary_path.iter().map(|hop| hop.node).collect();
        Tunnel::fsm(instance, &key, fsm::Event::PathRequest)?;
    }
    Ok(())
}

// Performs a secondary adjustment that was deferred during a reroute.
fn finish_adjustment(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        return Ok(());
    };
    if !tunnel.adjustment_required {
        return Ok(());
    }
    tunnel.adjustment_required = false;
    match tunnel.name.clone() {
        Some(name) => modify_secondary(instance, &name),
        None => Ok(()),
    }
}

fn switch_active(
    instance: &mut Instance,
    name: &str,
    to: TunnelKey,
    event: UserLspEvent,
) {
    let Some(user_lsp) = instance.user_lsps.get_mut(name) else {
        return;
    };
    if user_lsp.active == to {
        return;
    }
    user_lsp.active = to;
    notify(instance, &to, event);
}

// Secondary tunnel able to carry the traffic right away, hot-standby ones
// first.
fn standby_secondary(instance: &Instance, name: &str) -> Option<TunnelKey> {
    let user_lsp = instance.user_lsps.get(name)?;
    let is_up = |key: &TunnelKey| tunnel_is_up(instance, key);
    user_lsp.hot_standby_secondaries().find(is_up).or_else(|| {
        user_lsp.secondaries.iter().flatten().copied().find(is_up)
    })
}

// Hops of the primary path of a user LSP, short of its destination.
fn primary_path(instance: &Instance, user_lsp: &UserLsp) -> Vec<Hop> {
    let hops = instance
        .tunnels
        .get_by_key(&user_lsp.primary)
        .and_then(|(_, tunnel)| tunnel.working_route())
        .map(|route| route.hops().to_vec())
        .unwrap_or_else(|| user_lsp.cfg.primary.clone());
    hops.into_iter()
        .filter(|hop| hop.node != user_lsp.cfg.dst)
        .collect()
}

// Primary path of the user LSP a secondary tunnel belongs to.
fn primary_path_of(instance: &Instance, key: &TunnelKey) -> Option<Vec<Hop>> {
    let (_, tunnel) = instance.tunnels.get_by_key(key)?;
    if !matches!(tunnel.role, Some(PathRole::Secondary { .. })) {
        return None;
    }
    let user_lsp = instance.user_lsps.get(tunnel.name.as_ref()?)?;
    Some(primary_path(instance, user_lsp))
}

// ===== adaptivity =====

// Periodically looks for a better path for established tunnels whose path
// is not fully explicit.
pub(crate) fn adaptivity_timer(
    instance: &mut Instance,
    key: &TunnelKey,
) -> Result<(), Error> {
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        Debug::NoMatchingTunnel(key).log();
        return Ok(());
    };
    let interval = tunnel.cfg.adaptivity_interval;
    if !tunnel.reroute_in_progress && tunnel.is_path_flexible() {
        tunnel.exclude.clear();
        Tunnel::fsm(instance, key, fsm::Event::AdaptivityTimer)?;
    }
    if let Some(interval) = interval {
        instance.timers.start(TimerKey::Adaptivity(*key), interval);
    }
    Ok(())
}

fn rearm_adaptivity(instance: &mut Instance, key: &TunnelKey) {
    let timer = TimerKey::Adaptivity(*key);
    let Some(interval) = instance
        .tunnels
        .get_by_key(key)
        .and_then(|(_, tunnel)| tunnel.cfg.adaptivity_interval)
    else {
        instance.timers.stop(&timer);
        return;
    };
    if !instance.timers.is_active(&timer) {
        instance.timers.start(timer, interval);
    }
}

// ===== helper functions =====

// Removes a candidate, tearing it down on request, and gives back the
// bandwidth no remaining candidate needs.
fn drop_candidate(
    instance: &mut Instance,
    key: &TunnelKey,
    lsp_id: u16,
    tear: bool,
) -> Result<Option<Lsp>, Error> {
    let Some((_, tunnel)) = instance.tunnels.get_mut_by_key(key) else {
        return Ok(None);
    };
    let Some(lsp) = tunnel.remove_lsp(lsp_id) else {
        return Ok(None);
    };
    instance.timers.stop(&TimerKey::SetupTimeout(lsp.key));
    instance.timers.stop(&TimerKey::ResolverRetry(lsp.key));
    if tear && lsp.state != LspState::Resolving {
        send_signaling(instance, SignalingCmdMsg::PathTear { lsp: lsp.key });
    }

    release_candidate(instance, key, &lsp)?;
    Ok(Some(lsp))
}

// Resizes the reservations of a removed candidate's owner to what the
// remaining candidates need, releasing them altogether when unused.
fn release_candidate(
    instance: &mut Instance,
    key: &TunnelKey,
    lsp: &Lsp,
) -> Result<(), Error> {
    let owner = lsp.owner;
    let held = instance
        .ledger
        .owner_entries(&owner)
        .map(|(priority, entry)| {
            (priority, entry.te_link, entry.out_if, entry.bw)
        })
        .collect_vec();

    for (priority, te_link, out_if, committed) in held {
        let demand = instance
            .tunnels
            .get_by_key(key)
            .and_then(|(_, tunnel)| owner_demand(tunnel, &owner, out_if));
        let (ledger, mut cxt) = instance.ledger_cxt();
        match demand {
            None => ledger.release(&mut cxt, &owner, out_if, priority)?,
            Some((established, in_flight)) => {
                if committed > established {
                    ledger.commit(
                        &mut cxt,
                        &owner,
                        te_link,
                        out_if,
                        established,
                        priority,
                        lsp.attrs.setup_prio,
                    )?;
                }
                ledger.provisional_reserve(
                    &mut cxt,
                    &owner,
                    te_link,
                    out_if,
                    established.max(in_flight),
                    priority,
                )?;
            }
        }
    }
    Ok(())
}

// Largest bandwidth the candidates of an owner need on an interface, split
// into established and in-flight candidates. None when no candidate uses the
// interface.
fn owner_demand(
    tunnel: &Tunnel,
    owner: &OwnerKey,
    out_if: IfIndex,
) -> Option<(Bandwidth, Bandwidth)> {
    let mut demand = None;
    for lsp in tunnel.lsps.values().filter(|lsp| lsp.owner == *owner) {
        let uses_if = lsp
            .route
            .as_ref()
            .and_then(LspRoute::first_hop)
            .is_some_and(|first_hop| first_hop.out_if == out_if);
        if !uses_if {
            continue;
        }
        let (established, in_flight) = demand.get_or_insert((0, 0));
        if lsp.is_up() {
            *established = (*established).max(lsp.bw);
        } else {
            *in_flight = (*in_flight).max(lsp.bw);
        }
    }
    demand
}

// Candidate IDs with the working LSP last.
fn teardown_order(tunnel: &Tunnel) -> Vec<u16> {
    let (working, others): (Vec<u16>, Vec<u16>) = tunnel
        .lsps
        .keys()
        .copied()
        .partition(|lsp_id| tunnel.working == Some(*lsp_id));
    others.into_iter().chain(working).collect()
}

fn tunnel_is_up(instance: &Instance, key: &TunnelKey) -> bool {
    instance
        .tunnels
        .get_by_key(key)
        .is_some_and(|(_, tunnel)| tunnel.is_up())
}

fn send_signaling(instance: &Instance, msg: SignalingCmdMsg) {
    Debug::SignalingTx(&msg).log();
    let _ = instance.tx.signaling.send(msg);
}

fn notify(instance: &Instance, key: &TunnelKey, event: UserLspEvent) {
    let name = instance
        .tunnels
        .get_by_key(key)
        .and_then(|(_, tunnel)| tunnel.name.clone());
    let msg = UserLspNotifMsg {
        name,
        tunnel: *key,
        event,
    };
    Debug::UserLspNotif(&msg).log();
    let _ = instance.tx.user.send(msg);
}
