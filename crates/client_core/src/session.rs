use shared::{
    domain::{CaseId, Role},
    error::{ApiError, ErrorCode},
};
use tracing::{info, warn};

use crate::adapter::RemoteBackend;

pub const DEMO_CASE_ID: &str = "DEMO-01";

/// Transient launch state handed in by the host. The exchange token lives
/// only here; bootstrap consumes it and it is never retained.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub simulate: bool,
    pub case_id: Option<CaseId>,
    pub role: Option<Role>,
    pub exchange_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustSession {
    pub case_id: CaseId,
    pub role: Role,
    pub simulated: bool,
}

/// Resolves the viewer's operating mode, in priority order: explicit
/// simulation entry, one-time exchange token, existing server session.
/// `Ok(None)` means no active case; the workflow stays unauthenticated.
pub async fn bootstrap(
    mut launch: LaunchContext,
    remote: Option<&RemoteBackend>,
) -> Result<Option<TrustSession>, ApiError> {
    if launch.simulate {
        let case_id = launch
            .case_id
            .unwrap_or_else(|| CaseId::from(DEMO_CASE_ID));
        let role = launch.role.unwrap_or(Role::Agent);
        info!(case = %case_id, %role, "entering simulated session");
        return Ok(Some(TrustSession {
            case_id,
            role,
            simulated: true,
        }));
    }

    let Some(remote) = remote else {
        return Ok(None);
    };

    if let Some(token) = launch.exchange_token.take() {
        // The token is single-use: it leaves the launch state here no matter
        // how the exchange goes.
        match remote.exchange_session(&token).await {
            Ok(profile) => {
                info!(case = %profile.case_id, role = %profile.role, "session established from exchange token");
                return Ok(Some(TrustSession {
                    case_id: profile.case_id,
                    role: profile.role,
                    simulated: false,
                }));
            }
            Err(err) if err.code == ErrorCode::Unauthorized => {
                warn!("exchange token rejected; falling back to existing session");
            }
            Err(err) => return Err(err),
        }
    }

    match remote.current_session().await? {
        Some(profile) => Ok(Some(TrustSession {
            case_id: profile.case_id,
            role: profile.role,
            simulated: false,
        })),
        None => Ok(None),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
