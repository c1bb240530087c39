//! Axum REST API handlers.
//!
//! Mutating routes identify the acting address through the `x-caller`
//! header and run through [`AppState::mutate`]. Read routes take the read
//! lock and answer straight from the in-memory protocol, except the event
//! routes which read the SQLite journal.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ecotask_protocol::{
    Address, ContributionReceipt, CreditAllocation, Eligibility, ErrorKind, FinalizeCheck,
    FundingProgress, NewTask, OperatorSnapshot, Outcome, PaymentReceipt, Pool, Role, StakeLock,
    Task, TaskId, TaskStatus, Timestamp, Transfer, ValidatorEntry, VerificationRound, Vote,
    VoteReceipt, VotingProgress, WithdrawalReceipt,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::db;
use crate::errors::CoordinatorError;
use crate::events::EventRecord;
use crate::state::AppState;

pub const CALLER_HEADER: &str = "x-caller";

const DEFAULT_EVENT_LIMIT: i64 = 500;
const MAX_EVENT_LIMIT: i64 = 1_000;

type ApiResult<T> = std::result::Result<Json<T>, CoordinatorError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        // administration
        .route("/admin/pause", post(pause))
        .route("/admin/unpause", post(unpause))
        .route("/admin/super-admin", post(transfer_super_admin))
        .route("/roles", post(grant_role))
        .route("/roles/:address", get(role_of).delete(revoke_role))
        .route("/validators", get(validators))
        .route("/validators/:address/reputation", get(validator_reputation))
        // tasks
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/proof", post(submit_proof))
        .route("/tasks/:id/check-deadline", post(check_deadline))
        // funding
        .route("/tasks/:id/fund", post(fund_task))
        .route("/tasks/:id/withdraw", post(withdraw_funding))
        .route("/tasks/:id/refund", post(claim_refund))
        .route("/tasks/:id/release", post(release_payment))
        .route("/tasks/:id/enable-refunds", post(enable_refunds))
        .route("/tasks/:id/pool", get(get_pool))
        .route("/tasks/:id/progress", get(funding_progress))
        .route("/tasks/:id/funders", get(funders))
        .route("/tasks/:id/funders/:address", get(funder_share))
        .route("/tasks/:id/credits", get(credit_allocation))
        .route("/tasks/:id/transfers", get(task_transfers))
        // collateral
        .route("/tasks/:id/stake", post(stake_for_task))
        .route("/tasks/:id/stake-lock", get(stake_lock))
        .route("/tasks/:id/required-stake", get(required_stake))
        .route("/tasks/:id/eligibility/:operator", get(eligibility))
        .route("/stake/register", post(register_operator))
        .route("/stake/deposit", post(add_stake))
        .route("/stake/withdraw", post(withdraw_stake))
        .route("/operators/:address", get(get_operator))
        .route("/operators/:address/locked", get(locked_stake))
        // verification
        .route(
            "/tasks/:id/verification",
            get(get_round).post(initiate_verification),
        )
        .route("/tasks/:id/verification/votes", post(submit_vote))
        .route("/tasks/:id/verification/votes/:validator", get(get_vote))
        .route("/tasks/:id/verification/finalize", post(finalize_verification))
        .route("/tasks/:id/verification/status", get(verification_status))
        // treasury and accounts
        .route("/treasury", get(treasury))
        .route("/transfers", get(transfers))
        .route("/accounts/:address/credited", get(credited))
        .route("/accounts/:address/events", get(get_account_events))
        // keeper views
        .route("/maintenance/overdue", get(overdue_tasks))
        .route("/maintenance/expired-rounds", get(expired_rounds))
        // journal
        .route("/events", get(get_all_events))
        .route("/tasks/:id/events", get(get_task_events))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Caller identity and errors
// ─────────────────────────────────────────────────────────

/// The acting address, taken from the `x-caller` header.
#[derive(Debug, Clone)]
pub struct Caller(pub Address);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = CoordinatorError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Caller(Address::from(s)))
            .ok_or_else(|| CoordinatorError::BadRequest(format!("missing {CALLER_HEADER} header")))
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::State | ErrorKind::AlreadyDone | ErrorKind::Deadline => StatusCode::CONFLICT,
        ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Paused => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            CoordinatorError::Protocol(e) => (status_for(e.kind()), e.kind().as_str()),
            CoordinatorError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, kind, "request rejected");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GrantRoleRequest {
    pub target: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct TransferSuperAdminRequest {
    pub new_super_admin: String,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: i128,
}

#[derive(Debug, Deserialize)]
pub struct RegisterOperatorRequest {
    pub deposit: i128,
}

#[derive(Debug, Deserialize)]
pub struct ProofRequest {
    pub proof_ref: String,
    pub actual_outcome: i128,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub approve: bool,
    pub confidence_score: u32,
    #[serde(default)]
    pub justification: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub proposer: Option<String>,
    pub operator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only return events with a greater `seq`.
    pub after: Option<i64>,
    pub limit: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub paused: bool,
    pub task_count: u64,
    pub next_event_seq: u64,
    pub now: Timestamp,
}

#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub count: usize,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub address: Address,
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
pub struct ReputationResponse {
    pub validator: Address,
    pub reputation: u64,
}

#[derive(Debug, Serialize)]
pub struct AbandonedResponse {
    pub task_id: TaskId,
    pub previous_status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub task_id: TaskId,
    pub amount: i128,
}

#[derive(Debug, Serialize)]
pub struct FundersResponse {
    pub task_id: TaskId,
    pub count: usize,
    pub funders: Vec<FunderShare>,
}

#[derive(Debug, Serialize)]
pub struct FunderShare {
    pub funder: Address,
    pub share: i128,
    pub percentage_bps: u32,
}

#[derive(Debug, Serialize)]
pub struct RequiredStakeResponse {
    pub task_id: TaskId,
    pub required_stake: i128,
}

#[derive(Debug, Serialize)]
pub struct LockedStakeResponse {
    pub operator: Address,
    pub locked: i128,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub task_id: TaskId,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct VerificationStatusResponse {
    pub task_id: TaskId,
    pub can_finalize: FinalizeCheck,
    pub progress: Option<VotingProgress>,
}

#[derive(Debug, Serialize)]
pub struct TreasuryResponse {
    pub balance: i128,
}

#[derive(Debug, Serialize)]
pub struct TransfersResponse {
    pub count: usize,
    pub transfers: Vec<Transfer>,
}

#[derive(Debug, Serialize)]
pub struct CreditedResponse {
    pub address: Address,
    pub credited: i128,
}

#[derive(Debug, Serialize)]
pub struct TaskIdsResponse {
    pub count: usize,
    pub task_ids: Vec<TaskId>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub task_id: TaskId,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct AccountEventsResponse {
    pub address: String,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct AllEventsResponse {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

// ─────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /status`
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let protocol = state.protocol.read().await;
    Json(StatusResponse {
        paused: protocol.is_paused(),
        task_count: protocol.task_count(),
        next_event_seq: protocol.next_event_seq(),
        now: protocol.now(),
    })
}

// ─────────────────────────────────────────────────────────
// Administration
// ─────────────────────────────────────────────────────────

/// `POST /admin/pause`
pub async fn pause(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> std::result::Result<StatusCode, CoordinatorError> {
    state.mutate(|p| p.pause(&caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /admin/unpause`
pub async fn unpause(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> std::result::Result<StatusCode, CoordinatorError> {
    state.mutate(|p| p.unpause(&caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /admin/super-admin`
pub async fn transfer_super_admin(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<TransferSuperAdminRequest>,
) -> std::result::Result<StatusCode, CoordinatorError> {
    let new = Address::from(req.new_super_admin);
    state
        .mutate(|p| p.transfer_super_admin(&caller, &new))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /roles`
pub async fn grant_role(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<GrantRoleRequest>,
) -> ApiResult<RoleResponse> {
    let target = Address::from(req.target);
    state
        .mutate(|p| p.grant_role(&caller, &target, req.role))
        .await?;
    Ok(Json(RoleResponse {
        address: target,
        role: Some(req.role),
    }))
}

/// `DELETE /roles/:address`
pub async fn revoke_role(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(address): Path<String>,
) -> std::result::Result<StatusCode, CoordinatorError> {
    let target = Address::from(address);
    state.mutate(|p| p.revoke_role(&caller, &target)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /roles/:address`
pub async fn role_of(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Json<RoleResponse> {
    let address = Address::from(address);
    let role = state.protocol.read().await.role_of(&address);
    Json(RoleResponse { address, role })
}

/// `GET /validators`
///
/// The full roster, revoked entries included.
pub async fn validators(State(state): State<Arc<AppState>>) -> Json<Vec<ValidatorEntry>> {
    Json(state.protocol.read().await.validators().to_vec())
}

/// `GET /validators/:address/reputation`
pub async fn validator_reputation(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Json<ReputationResponse> {
    let validator = Address::from(address);
    let reputation = state.protocol.read().await.validator_reputation(&validator);
    Json(ReputationResponse {
        validator,
        reputation,
    })
}

// ─────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────

/// `POST /tasks`
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(params): Json<NewTask>,
) -> std::result::Result<(StatusCode, Json<Task>), CoordinatorError> {
    let task = state.mutate(|p| p.create_task(&caller, params)).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks?status=&proposer=&operator=`
///
/// Filters combine; with no filter every task is returned in id order.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> Json<TasksResponse> {
    let protocol = state.protocol.read().await;
    let mut tasks = match (&query.proposer, &query.operator, query.status) {
        (Some(proposer), _, _) => protocol.tasks_by_proposer(&Address::new(proposer.as_str())),
        (None, Some(operator), _) => protocol.tasks_by_operator(&Address::new(operator.as_str())),
        (None, None, Some(status)) => protocol.tasks_by_status(status),
        (None, None, None) => {
            let ids: Vec<TaskId> = (0..protocol.task_count()).collect();
            protocol.tasks(&ids)
        }
    };
    if let Some(status) = query.status {
        tasks.retain(|t| t.status == status);
    }
    if let Some(operator) = &query.operator {
        tasks.retain(|t| {
            t.assigned_operator
                .as_ref()
                .is_some_and(|a| a.as_str() == operator)
        });
    }
    Json(TasksResponse {
        count: tasks.len(),
        tasks,
    })
}

/// `GET /tasks/:id`
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Task> {
    let protocol = state.protocol.read().await;
    Ok(Json(protocol.task(id)?.clone()))
}

/// `POST /tasks/:id/proof`
pub async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
    Json(req): Json<ProofRequest>,
) -> ApiResult<Task> {
    let task = state
        .mutate(|p| p.submit_proof(&caller, id, &req.proof_ref, req.actual_outcome))
        .await?;
    Ok(Json(task))
}

/// `POST /tasks/:id/check-deadline`
///
/// Open to anyone; succeeds only once the grace period has passed.
pub async fn check_deadline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<AbandonedResponse> {
    let previous_status = state.mutate(|p| p.check_deadline(id)).await?;
    Ok(Json(AbandonedResponse {
        task_id: id,
        previous_status,
    }))
}

// ─────────────────────────────────────────────────────────
// Funding
// ─────────────────────────────────────────────────────────

/// `POST /tasks/:id/fund`
pub async fn fund_task(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<ContributionReceipt> {
    let receipt = state
        .mutate(|p| p.fund_task(&caller, id, req.amount))
        .await?;
    Ok(Json(receipt))
}

/// `POST /tasks/:id/withdraw`
pub async fn withdraw_funding(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
) -> ApiResult<WithdrawalReceipt> {
    let receipt = state.mutate(|p| p.withdraw_funding(&caller, id)).await?;
    Ok(Json(receipt))
}

/// `POST /tasks/:id/refund`
pub async fn claim_refund(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
) -> ApiResult<RefundResponse> {
    let amount = state.mutate(|p| p.claim_refund(&caller, id)).await?;
    Ok(Json(RefundResponse {
        task_id: id,
        amount,
    }))
}

/// `POST /tasks/:id/release`
pub async fn release_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<PaymentReceipt> {
    let receipt = state.mutate(|p| p.release_payment(id)).await?;
    Ok(Json(receipt))
}

/// `POST /tasks/:id/enable-refunds`
pub async fn enable_refunds(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> std::result::Result<StatusCode, CoordinatorError> {
    state.mutate(|p| p.enable_refunds(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /tasks/:id/pool`
pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Pool> {
    let protocol = state.protocol.read().await;
    Ok(Json(protocol.pool(id)?.clone()))
}

/// `GET /tasks/:id/progress`
pub async fn funding_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<FundingProgress> {
    Ok(Json(state.protocol.read().await.funding_progress(id)?))
}

/// `GET /tasks/:id/funders`
pub async fn funders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<FundersResponse> {
    let protocol = state.protocol.read().await;
    let funders = protocol
        .funders(id)?
        .into_iter()
        .map(|(funder, share)| -> ecotask_protocol::Result<FunderShare> {
            let percentage_bps = protocol.share_percentage_bps(id, &funder)?;
            Ok(FunderShare {
                funder,
                share,
                percentage_bps,
            })
        })
        .collect::<ecotask_protocol::Result<Vec<_>>>()?;
    Ok(Json(FundersResponse {
        task_id: id,
        count: funders.len(),
        funders,
    }))
}

/// `GET /tasks/:id/funders/:address`
pub async fn funder_share(
    State(state): State<Arc<AppState>>,
    Path((id, address)): Path<(TaskId, String)>,
) -> ApiResult<FunderShare> {
    let protocol = state.protocol.read().await;
    let funder = Address::from(address);
    Ok(Json(FunderShare {
        share: protocol.share_of(id, &funder)?,
        percentage_bps: protocol.share_percentage_bps(id, &funder)?,
        funder,
    }))
}

/// `GET /tasks/:id/credits`
///
/// Outcome units owed to each funder of a verified task.
pub async fn credit_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Vec<CreditAllocation>> {
    Ok(Json(state.protocol.read().await.credit_allocation(id)?))
}

/// `GET /tasks/:id/transfers?after=&limit=`
///
/// Rebuilt from the journal, like `GET /transfers`.
pub async fn task_transfers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<TransfersResponse> {
    let task_id = i64::try_from(id)
        .map_err(|_| CoordinatorError::BadRequest(format!("task id {id} out of range")))?;
    journal_transfers(&state, Some(task_id), query).await
}

// ─────────────────────────────────────────────────────────
// Collateral
// ─────────────────────────────────────────────────────────

/// `POST /stake/register`
pub async fn register_operator(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<RegisterOperatorRequest>,
) -> std::result::Result<(StatusCode, Json<OperatorSnapshot>), CoordinatorError> {
    let snapshot = state
        .mutate(|p| p.register_operator(&caller, req.deposit))
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// `POST /stake/deposit`
pub async fn add_stake(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<AmountRequest>,
) -> ApiResult<OperatorSnapshot> {
    let snapshot = state.mutate(|p| p.add_stake(&caller, req.amount)).await?;
    Ok(Json(snapshot))
}

/// `POST /stake/withdraw`
pub async fn withdraw_stake(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<AmountRequest>,
) -> ApiResult<OperatorSnapshot> {
    let snapshot = state
        .mutate(|p| p.withdraw_stake(&caller, req.amount))
        .await?;
    Ok(Json(snapshot))
}

/// `POST /tasks/:id/stake`
///
/// The caller locks collateral and becomes the task's operator.
pub async fn stake_for_task(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
) -> ApiResult<StakeLock> {
    let lock = state.mutate(|p| p.stake_for_task(&caller, id)).await?;
    Ok(Json(lock))
}

/// `GET /operators/:address`
pub async fn get_operator(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<OperatorSnapshot> {
    let operator = Address::from(address);
    Ok(Json(state.protocol.read().await.operator(&operator)?))
}

/// `GET /operators/:address/locked`
pub async fn locked_stake(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Json<LockedStakeResponse> {
    let operator = Address::from(address);
    let locked = state.protocol.read().await.locked_stake_of(&operator);
    Json(LockedStakeResponse { operator, locked })
}

/// `GET /tasks/:id/stake-lock`
pub async fn stake_lock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<StakeLock> {
    let protocol = state.protocol.read().await;
    Ok(Json(protocol.stake_lock(id)?.clone()))
}

/// `GET /tasks/:id/required-stake`
pub async fn required_stake(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<RequiredStakeResponse> {
    let required_stake = state.protocol.read().await.required_stake(id)?;
    Ok(Json(RequiredStakeResponse {
        task_id: id,
        required_stake,
    }))
}

/// `GET /tasks/:id/eligibility/:operator`
pub async fn eligibility(
    State(state): State<Arc<AppState>>,
    Path((id, operator)): Path<(TaskId, String)>,
) -> Json<Eligibility> {
    let operator = Address::from(operator);
    Json(state.protocol.read().await.can_accept_task(&operator, id))
}

// ─────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────

/// `POST /tasks/:id/verification`
///
/// Open to anyone once proof is under review.
pub async fn initiate_verification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> std::result::Result<(StatusCode, Json<VerificationRound>), CoordinatorError> {
    let round = state.mutate(|p| p.initiate_verification(id)).await?;
    Ok((StatusCode::CREATED, Json(round)))
}

/// `GET /tasks/:id/verification`
pub async fn get_round(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<VerificationRound> {
    let protocol = state.protocol.read().await;
    Ok(Json(protocol.round(id)?.clone()))
}

/// `POST /tasks/:id/verification/votes`
pub async fn submit_vote(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<TaskId>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<VoteReceipt> {
    let receipt = state
        .mutate(|p| {
            p.submit_vote(
                &caller,
                id,
                req.approve,
                req.confidence_score,
                &req.justification,
            )
        })
        .await?;
    Ok(Json(receipt))
}

/// `GET /tasks/:id/verification/votes/:validator`
pub async fn get_vote(
    State(state): State<Arc<AppState>>,
    Path((id, validator)): Path<(TaskId, String)>,
) -> ApiResult<Vote> {
    let protocol = state.protocol.read().await;
    let validator = Address::from(validator);
    Ok(Json(protocol.vote(id, &validator)?.clone()))
}

/// `POST /tasks/:id/verification/finalize`
///
/// Open to anyone once the voting window has closed.
pub async fn finalize_verification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<FinalizeResponse> {
    let outcome = state.mutate(|p| p.finalize_verification(id)).await?;
    Ok(Json(FinalizeResponse {
        task_id: id,
        outcome,
    }))
}

/// `GET /tasks/:id/verification/status`
pub async fn verification_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Json<VerificationStatusResponse> {
    let protocol = state.protocol.read().await;
    Json(VerificationStatusResponse {
        task_id: id,
        can_finalize: protocol.can_finalize(id),
        progress: protocol.voting_progress(id).ok(),
    })
}

// ─────────────────────────────────────────────────────────
// Treasury, accounts and keeper views
// ─────────────────────────────────────────────────────────

/// `GET /treasury`
pub async fn treasury(State(state): State<Arc<AppState>>) -> Json<TreasuryResponse> {
    let protocol = state.protocol.read().await;
    Json(TreasuryResponse {
        balance: protocol.treasury_balance(),
    })
}

/// `GET /transfers?after=&limit=`
///
/// Itemised payouts, penalties, fees and slashes. `after` and `limit` page
/// over the journal events the transfers come from, not over transfers.
pub async fn transfers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<TransfersResponse> {
    journal_transfers(&state, None, query).await
}

async fn journal_transfers(
    state: &AppState,
    task_id: Option<i64>,
    query: EventsQuery,
) -> ApiResult<TransfersResponse> {
    let limit = event_limit(&query);
    let records = db::get_value_events(&state.pool, task_id, query.after, limit).await?;
    let mut transfers = Vec::new();
    for record in &records {
        transfers.extend(record.transfers()?);
    }
    Ok(Json(TransfersResponse {
        count: transfers.len(),
        transfers,
    }))
}

/// `GET /accounts/:address/credited`
///
/// Total ever paid out to `address` (refunds, payments, returned stake).
pub async fn credited(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Json<CreditedResponse> {
    let address = Address::from(address);
    let credited = state.protocol.read().await.credited(&address);
    Json(CreditedResponse { address, credited })
}

/// `GET /maintenance/overdue`
pub async fn overdue_tasks(State(state): State<Arc<AppState>>) -> Json<TaskIdsResponse> {
    let task_ids = state.protocol.read().await.overdue_tasks();
    Json(TaskIdsResponse {
        count: task_ids.len(),
        task_ids,
    })
}

/// `GET /maintenance/expired-rounds`
pub async fn expired_rounds(State(state): State<Arc<AppState>>) -> Json<TaskIdsResponse> {
    let task_ids = state.protocol.read().await.expired_rounds();
    Json(TaskIdsResponse {
        count: task_ids.len(),
        task_ids,
    })
}

// ─────────────────────────────────────────────────────────
// Journal
// ─────────────────────────────────────────────────────────

fn event_limit(query: &EventsQuery) -> i64 {
    query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT)
}

/// `GET /events?after=&limit=`
///
/// Returns journaled events across all tasks, oldest first.
pub async fn get_all_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<AllEventsResponse> {
    let limit = event_limit(&query);
    let events = db::get_all_events(&state.pool, query.after, limit).await?;
    Ok(Json(AllEventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /tasks/:id/events`
pub async fn get_task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<EventsResponse> {
    let task_id = i64::try_from(id)
        .map_err(|_| CoordinatorError::BadRequest(format!("task id {id} out of range")))?;
    let events = db::get_events_for_task(&state.pool, task_id).await?;
    Ok(Json(EventsResponse {
        task_id: id,
        count: events.len(),
        events,
    }))
}

/// `GET /accounts/:address/events`
pub async fn get_account_events(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<AccountEventsResponse> {
    let events = db::get_events_for_actor(&state.pool, &address).await?;
    Ok(Json(AccountEventsResponse {
        address,
        count: events.len(),
        events,
    }))
}
