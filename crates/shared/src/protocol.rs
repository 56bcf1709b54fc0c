use serde::{Deserialize, Serialize};

use crate::domain::{CaseId, Role, StepData, Transaction};

/// One user-initiated action against a case, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustAction {
    Submit { step: u8, data: StepData },
    Confirm { step: u8, note: Option<String> },
    Payment,
    Checklist { item_id: String, checked: bool },
    Supplement { content: String },
    Reset,
}

impl TrustAction {
    /// The per-action path segment on the remote endpoint.
    pub fn endpoint(&self) -> &'static str {
        match self {
            TrustAction::Submit { .. } => "submit",
            TrustAction::Confirm { .. } => "confirm",
            TrustAction::Payment => "payment",
            TrustAction::Checklist { .. } => "checklist",
            TrustAction::Supplement { .. } => "supplement",
            TrustAction::Reset => "reset",
        }
    }

    pub fn to_body(&self) -> ActionBody {
        let mut body = ActionBody::default();
        match self {
            TrustAction::Submit { step, data } => {
                body.step = Some(*step);
                body.data = Some(data.clone());
            }
            TrustAction::Confirm { step, note } => {
                body.step = Some(*step);
                body.note = note.clone();
            }
            TrustAction::Payment => {}
            TrustAction::Checklist { item_id, checked } => {
                body.item_id = Some(item_id.clone());
                body.checked = Some(*checked);
            }
            TrustAction::Supplement { content } => {
                body.content = Some(content.clone());
            }
            TrustAction::Reset => {}
        }
        body
    }

    /// Rebuilds the action from its endpoint name and wire body. `fallback_step`
    /// is the case's current step, used when the body omits `step`.
    pub fn from_body(endpoint: &str, body: ActionBody, fallback_step: u8) -> Option<Self> {
        match endpoint {
            "submit" => Some(TrustAction::Submit {
                step: body.step.unwrap_or(fallback_step),
                data: body.data.unwrap_or_default(),
            }),
            "confirm" => Some(TrustAction::Confirm {
                step: body.step.unwrap_or(fallback_step),
                note: body.note,
            }),
            "payment" => Some(TrustAction::Payment),
            "checklist" => Some(TrustAction::Checklist {
                item_id: body.item_id?,
                checked: body.checked?,
            }),
            "supplement" => Some(TrustAction::Supplement {
                content: body.content?,
            }),
            "reset" => Some(TrustAction::Reset),
            _ => None,
        }
    }
}

/// The JSON body accepted by every per-action endpoint; fields are present
/// or absent depending on the action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StepData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub success: bool,
    pub state: Transaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExchangeRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    pub case_id: CaseId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaseRequest {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
}

/// A freshly minted case with one single-use entry token per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaseResponse {
    pub case_id: CaseId,
    pub agent_token: String,
    pub buyer_token: String,
}
