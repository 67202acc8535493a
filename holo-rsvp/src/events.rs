//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Instance;
use crate::ledger::te_link_feedback;
use crate::lifecycle;
use crate::tasks::messages::input::{
    ComponentLinkUpdMsg, PathReplyMsg, PreemptedMsg, SignalingNotifMsg,
    TimerExpiryMsg, TopologyMsg, UserRequestMsg,
};
use crate::tasks::messages::output::SetupFailReason;
use crate::te::{ComponentLink, IfIndex, TeLinkId};
use crate::timers::TimerKey;
use crate::tunnel::{Tunnel, fsm};

// ===== user requests =====

pub(crate) fn process_user_request(
    instance: &mut Instance,
    msg: UserRequestMsg,
) -> Result<(), Error> {
    match msg {
        UserRequestMsg::Lsp(req) => {
            lifecycle::lsp_request(instance, req)?;
        }
        UserRequestMsg::LspDelete(key) => {
            lifecycle::delete_tunnel(instance, &key)?;
        }
        UserRequestMsg::UserLspCreate(cfg) => {
            lifecycle::user_lsp_create(instance, cfg)?;
        }
        UserRequestMsg::UserLspUpdate(cfg) => {
            lifecycle::user_lsp_update(instance, cfg)?;
        }
        UserRequestMsg::UserLspDelete(name) => {
            lifecycle::user_lsp_delete(instance, &name)?;
        }
    }

    Ok(())
}

// ===== topology updates =====

pub(crate) fn process_topology(
    instance: &mut Instance,
    msg: TopologyMsg,
) -> Result<(), Error> {
    match msg {
        TopologyMsg::TeLinkUpd(te_link) => {
            Debug::TeLinkUpdate(&te_link.id).log();
            instance.te_db.add_te_link(te_link);
        }
        TopologyMsg::ComponentLinkUpd(msg) => {
            process_component_link_upd(instance, msg)?;
        }
        TopologyMsg::ComponentLinkDel(ifindex) => {
            let te_link = instance
                .te_db
                .component_link(ifindex)
                .map(|link| link.te_link)
                .ok_or(Error::ComponentLinkNotFound(ifindex))?;
            remove_component_link(instance, ifindex, te_link)?;
        }
    }

    Ok(())
}

fn process_component_link_upd(
    instance: &mut Instance,
    msg: ComponentLinkUpdMsg,
) -> Result<(), Error> {
    let current = instance
        .te_db
        .component_link(msg.ifindex)
        .map(|link| link.te_link);

    match current {
        Some(te_link) if te_link == msg.te_link => {
            Debug::ComponentLinkUpdate(msg.ifindex, &msg.configured).log();
            instance
                .te_db
                .component_link_mut(msg.ifindex)?
                .set_configured(msg.configured)?;
        }
        current => {
            // The interface moved to a different TE link.
            if let Some(te_link) = current {
                remove_component_link(instance, msg.ifindex, te_link)?;
            }

            let link =
                ComponentLink::new(msg.ifindex, msg.te_link, msg.configured)?;
            instance.te_db.add_component_link(link)?;
            Debug::ComponentLinkCreate(msg.ifindex, &msg.te_link).log();
        }
    }

    let (_, cxt) = instance.ledger_cxt();
    te_link_feedback(&cxt, msg.te_link);
    Ok(())
}

fn remove_component_link(
    instance: &mut Instance,
    ifindex: IfIndex,
    te_link: TeLinkId,
) -> Result<(), Error> {
    // Holders are notified as if they were preempted.
    let (ledger, mut cxt) = instance.ledger_cxt();
    ledger.evict_interface(&mut cxt, ifindex)?;
    cxt.te_db.remove_component_link(ifindex);
    Debug::ComponentLinkDelete(ifindex).log();

    te_link_feedback(&cxt, te_link);
    Ok(())
}

// ===== path resolver replies =====

pub(crate) fn process_path_reply(
    instance: &mut Instance,
    msg: PathReplyMsg,
) -> Result<(), Error> {
    lifecycle::path_reply(instance, &msg.lsp, msg.result)
}

// ===== signaling notifications =====

pub(crate) fn process_signaling(
    instance: &mut Instance,
    msg: SignalingNotifMsg,
) -> Result<(), Error> {
    match msg {
        SignalingNotifMsg::Up { lsp, bw, labels } => {
            lifecycle::lsp_up(instance, &lsp, bw, labels)
        }
        SignalingNotifMsg::Failed { lsp, node } => lifecycle::lsp_failed(
            instance,
            &lsp,
            SetupFailReason::Signaling(node),
            node,
        ),
        SignalingNotifMsg::Tear { lsp } => lifecycle::lsp_failed(
            instance,
            &lsp,
            SetupFailReason::Signaling(None),
            None,
        ),
    }
}

// ===== preempted reservations =====

pub(crate) fn process_preempted(
    instance: &mut Instance,
    msg: PreemptedMsg,
) -> Result<(), Error> {
    lifecycle::preempted(instance, msg)
}

// ===== timer expirations =====

pub(crate) fn process_timer_expiry(
    instance: &mut Instance,
    msg: TimerExpiryMsg,
) -> Result<(), Error> {
    // Ignore timers that were stopped or rearmed in the meantime.
    if !instance.timers.expired(&msg) {
        return Ok(());
    }
    Debug::TimerExpiry(&msg.key).log();

    match msg.key {
        TimerKey::Hold {
            owner,
            out_if,
            priority,
            ..
        } => {
            let (ledger, mut cxt) = instance.ledger_cxt();
            ledger.hold_timer_expiry(&mut cxt, &owner, out_if, priority)
        }
        TimerKey::SetupTimeout(lsp) => lifecycle::setup_failed(
            instance,
            &lsp,
            SetupFailReason::Timeout,
            None,
        ),
        TimerKey::ResolverRetry(lsp) => {
            lifecycle::resolver_retry(instance, &lsp)
        }
        TimerKey::SetupRetry(tunnel) => {
            if instance.tunnels.get_by_key(&tunnel).is_none() {
                Debug::NoMatchingTunnel(&tunnel).log();
                return Ok(());
            }
            Tunnel::fsm(instance, &tunnel, fsm::Event::RetryTimer)
        }
        TimerKey::Adaptivity(tunnel) => {
            lifecycle::adaptivity_timer(instance, &tunnel)
        }
    }
}
