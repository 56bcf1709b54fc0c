use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{
        AgentStatus, BuyerStatus, ChecklistItem, PaymentStatus, RiskFlags, Role, Supplement,
        Transaction, FIRST_STEP, HANDOVER_STEP, LAST_STEP, PAYMENT_STEP, RISK_STEP,
    },
    error::{ApiError, ErrorCode},
    protocol::TrustAction,
};

/// Applies one action to a case and returns the updated state, or a typed
/// failure with no mutation. Both backends run this same table: the simulated
/// backend calls it directly, the server runs it behind the remote endpoints.
///
/// `now` is the caller's clock; `payment_window` is the span granted once the
/// buyer confirms the contract step.
pub fn apply(
    tx: &Transaction,
    action: &TrustAction,
    role: Role,
    now: DateTime<Utc>,
    payment_window: Duration,
) -> Result<Transaction, ApiError> {
    let mut next = tx.clone();
    expire_if_overdue(&mut next, now);

    match action {
        TrustAction::Submit { step, data } => {
            if role != Role::Agent {
                return Err(ApiError::permission_denied("submit is an agent action"));
            }
            let step_no = *step;
            ensure_active_step(&next, step_no)?;
            let target = next
                .step_mut(step_no)
                .ok_or_else(|| ApiError::invalid_state("no such step"))?;
            if target.agent_status != AgentStatus::Pending {
                return Err(ApiError::invalid_state("agent has already submitted"));
            }
            target.data.merge(data.clone());
            target.agent_status = AgentStatus::Submitted;
        }

        TrustAction::Confirm { step, note } => {
            if role != Role::Buyer {
                return Err(ApiError::permission_denied("confirm is a buyer action"));
            }
            let step_no = *step;
            ensure_active_step(&next, step_no)?;
            if step_no == HANDOVER_STEP && !next.is_paid {
                return Err(ApiError::invalid_state("case is unpaid"));
            }
            let target = next
                .step_mut(step_no)
                .ok_or_else(|| ApiError::invalid_state("no such step"))?;
            if target.agent_status != AgentStatus::Submitted {
                return Err(ApiError::invalid_state("agent has not submitted yet"));
            }

            if step_no == PAYMENT_STEP {
                if target.payment_status != Some(PaymentStatus::Pending) {
                    return Err(ApiError::invalid_state("payment already initiated"));
                }
                target.buyer_status = BuyerStatus::Confirmed;
                if let Some(note) = note {
                    target.data.buyer_note = Some(note.clone());
                }
                target.payment_status = Some(PaymentStatus::Initiated);
                target.payment_deadline = Some(now + payment_window);
            } else if step_no == HANDOVER_STEP {
                let all_checked = target
                    .checklist
                    .as_ref()
                    .is_some_and(|items| !items.is_empty() && items.iter().all(|i| i.checked));
                if !all_checked {
                    return Err(ApiError::new(
                        ErrorCode::IncompleteChecklist,
                        "handover checklist incomplete",
                    ));
                }
                target.buyer_status = BuyerStatus::Confirmed;
                if let Some(note) = note {
                    target.data.buyer_note = Some(note.clone());
                }
                target.locked = true;
                // Terminal: current_step stays at the handover step.
            } else {
                target.buyer_status = BuyerStatus::Confirmed;
                if let Some(note) = note {
                    target.data.buyer_note = Some(note.clone());
                }
                target.locked = true;
                next.current_step += 1;
            }
        }

        TrustAction::Payment => {
            if role != Role::Agent {
                return Err(ApiError::permission_denied("payment is an agent action"));
            }
            let contract = next
                .step_mut(PAYMENT_STEP)
                .ok_or_else(|| ApiError::invalid_state("no such step"))?;
            match contract.payment_status {
                Some(PaymentStatus::Initiated) => {}
                Some(PaymentStatus::Expired) => {
                    return Err(ApiError::invalid_state("payment window has expired"));
                }
                _ => return Err(ApiError::invalid_state("payment window is not open")),
            }
            contract.payment_status = Some(PaymentStatus::Completed);
            contract.locked = true;
            next.is_paid = true;
            next.current_step = HANDOVER_STEP;

            let risks = next
                .step(RISK_STEP)
                .and_then(|step| step.data.risks)
                .unwrap_or_default();
            if let Some(handover) = next.step_mut(HANDOVER_STEP) {
                handover.checklist = Some(synthesize_checklist(&risks));
            }
        }

        TrustAction::Checklist { item_id, checked } => {
            if role != Role::Buyer {
                return Err(ApiError::permission_denied("checklist is a buyer action"));
            }
            if !next.is_paid {
                return Err(ApiError::invalid_state("case is unpaid"));
            }
            let handover = next
                .step_mut(HANDOVER_STEP)
                .ok_or_else(|| ApiError::invalid_state("no such step"))?;
            if handover.locked {
                return Err(ApiError::invalid_state("step already locked"));
            }
            let item = handover
                .checklist
                .as_mut()
                .and_then(|items| items.iter_mut().find(|item| item.id == *item_id))
                .ok_or_else(|| ApiError::invalid_state("unknown checklist item"))?;
            item.checked = *checked;
        }

        TrustAction::Supplement { content } => {
            next.supplements.push(Supplement {
                role,
                content: content.clone(),
                timestamp: now,
            });
        }

        TrustAction::Reset => {
            next = Transaction::initial(next.id.clone());
        }
    }

    Ok(next)
}

/// Lazy expiry rule: an elapsed deadline with the window still open flips the
/// payment to expired. Runs before every dispatch and on every fetch; never
/// locks the step or advances the case.
pub fn expire_if_overdue(tx: &mut Transaction, now: DateTime<Utc>) -> bool {
    let Some(contract) = tx.step_mut(PAYMENT_STEP) else {
        return false;
    };
    if contract.payment_status == Some(PaymentStatus::Initiated) {
        if let Some(deadline) = contract.payment_deadline {
            if now > deadline {
                contract.payment_status = Some(PaymentStatus::Expired);
                return true;
            }
        }
    }
    false
}

/// Handover checklist, synthesized once payment completes: fixed handover
/// items plus one verification entry per viewing-stage risk disclosure.
pub fn synthesize_checklist(risks: &RiskFlags) -> Vec<ChecklistItem> {
    let disclosure = |flagged: bool| if flagged { "reported" } else { "no" };
    vec![
        item("utilities", "Water, electricity and gas in working order"),
        item("locks", "Door and window locks operate correctly"),
        item("keys", "Keys and access cards handed over"),
        item(
            "risk-water",
            &format!("Verify disclosure: {} water leakage", disclosure(risks.water)),
        ),
        item(
            "risk-wall",
            &format!("Verify disclosure: {} wall damp", disclosure(risks.wall)),
        ),
    ]
}

fn item(id: &str, label: &str) -> ChecklistItem {
    ChecklistItem {
        id: id.to_string(),
        label: label.to_string(),
        checked: false,
    }
}

fn ensure_active_step(tx: &Transaction, step_no: u8) -> Result<(), ApiError> {
    if step_no < FIRST_STEP || step_no > LAST_STEP {
        return Err(ApiError::invalid_state("no such step"));
    }
    if step_no != tx.current_step {
        return Err(ApiError::invalid_state("not the active step"));
    }
    if tx.step(step_no).is_some_and(|step| step.locked) {
        return Err(ApiError::invalid_state("step already locked"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
