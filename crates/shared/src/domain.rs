use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Buyer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Buyer => "buyer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const FIRST_STEP: u8 = 1;
pub const LAST_STEP: u8 = 6;
pub const RISK_STEP: u8 = 2;
pub const PAYMENT_STEP: u8 = 5;
pub const HANDOVER_STEP: u8 = 6;

pub const STAGE_NAMES: [&str; LAST_STEP as usize] = [
    "Contact",
    "Viewing",
    "Offer",
    "Negotiation",
    "Contract & Payment",
    "Handover",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyerStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Initiated,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskFlags {
    pub water: bool,
    pub wall: bool,
    pub structure: bool,
    pub other: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risks: Option<RiskFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_note: Option<String>,
}

impl StepData {
    // Shallow merge: fields present in `incoming` overwrite, absent fields keep
    // their prior value.
    pub fn merge(&mut self, incoming: StepData) {
        if let Some(note) = incoming.note {
            self.note = Some(note);
        }
        if let Some(risks) = incoming.risks {
            self.risks = Some(risks);
        }
        if let Some(buyer_note) = incoming.buyer_note {
            self.buyer_note = Some(buyer_note);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub label: String,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub agent_status: AgentStatus,
    pub buyer_status: BuyerStatus,
    pub locked: bool,
    #[serde(default)]
    pub data: StepData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist: Option<Vec<ChecklistItem>>,
}

impl Step {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            agent_status: AgentStatus::Pending,
            buyer_status: BuyerStatus::Pending,
            locked: false,
            data: StepData::default(),
            payment_status: None,
            payment_deadline: None,
            checklist: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplement {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: CaseId,
    pub current_step: u8,
    pub is_paid: bool,
    pub steps: BTreeMap<u8, Step>,
    pub supplements: Vec<Supplement>,
}

impl Transaction {
    /// Creation factory: the step-1 initial state for a case.
    pub fn initial(id: CaseId) -> Self {
        let mut steps = BTreeMap::new();
        for (index, name) in STAGE_NAMES.iter().enumerate() {
            let step_no = index as u8 + 1;
            let mut step = Step::new(name);
            if step_no == RISK_STEP {
                step.data.risks = Some(RiskFlags::default());
            }
            if step_no == PAYMENT_STEP {
                step.payment_status = Some(PaymentStatus::Pending);
            }
            if step_no == HANDOVER_STEP {
                step.checklist = Some(Vec::new());
            }
            steps.insert(step_no, step);
        }
        Self {
            id,
            current_step: FIRST_STEP,
            is_paid: false,
            steps,
            supplements: Vec::new(),
        }
    }

    pub fn step(&self, step_no: u8) -> Option<&Step> {
        self.steps.get(&step_no)
    }

    pub fn step_mut(&mut self, step_no: u8) -> Option<&mut Step> {
        self.steps.get_mut(&step_no)
    }

    /// Terminal state: the handover step has locked and nothing follows it.
    pub fn is_settled(&self) -> bool {
        self.step(HANDOVER_STEP).is_some_and(|step| step.locked)
    }
}
