//! Token acquisition pipeline.
//!
//! A request runs an ordered plan of [`Step`]s against the reward platform:
//! `ListAwards?` -> `ClaimAward` -> `ProbeComponents?` -> `ExchangeFaceToken`.
//! Each step reads and extends the [`PipelineContext`]; the first step that
//! fails ends the run with a [`PipelineFailure`] carrying the trace so far.

use log::info;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_status::{self, AppStatus};
use crate::network_client::{
    NetworkError, UpstreamClient, UpstreamResponse, CLAIM_AWARD_PATH, FACE_TOKEN_PATH, LIST_AWARDS_PATH,
    RISK_COMPONENTS_PATH,
};
use crate::session::SessionError;
use crate::utils;

/// Application code seen alongside a usable risk token when the award was
/// already claimed. The only non-zero code the claim step tolerates by default.
pub const ALREADY_CLAIMED_RET_CODE: i64 = 40012;

const RISK_TOKEN_PREVIEW_CHARS: usize = 30;

/// Award id or spec code kept in the JSON form it arrived in, so a numeric
/// id goes back upstream as a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AwardValue(Value);

impl AwardValue {
    /// Accepts non-empty strings and numbers.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(AwardValue(value.clone())),
            Value::Number(_) => Some(AwardValue(value.clone())),
            _ => None,
        }
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }
}

impl std::fmt::Display for AwardValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardSelector {
    pub award_id: AwardValue,
    /// `None` lets the platform pick its default variant.
    pub spec_code: Option<AwardValue>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub probe_components: bool,
    pub benign_ret_code: i64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions { probe_components: false, benign_ret_code: ALREADY_CLAIMED_RET_CODE }
    }
}

/// Ordered, human readable trace of one request. Every entry is also logged.
#[derive(Debug, Default)]
pub struct TraceLog {
    entries: Vec<String>,
}

impl TraceLog {
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.entries.push(message);
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// Per-request state threaded through the steps.
#[derive(Debug)]
pub struct PipelineContext {
    pub cookies: String,
    pub award: Option<AwardSelector>,
    pub risk_token: Option<String>,
    pub final_url: Option<String>,
    pub trace: TraceLog,
}

impl PipelineContext {
    pub fn new(cookies: String, award: Option<AwardSelector>, trace: TraceLog) -> Self {
        PipelineContext { cookies, award, risk_token: None, final_url: None, trace }
    }

    fn log(&mut self, message: impl Into<String>) {
        self.trace.push(message);
    }
}

#[derive(Debug)]
pub enum PipelineError {
    InvalidInput(String),
    MissingInput(String),
    UpstreamList { details: Value },
    NoAwardsFound { details: Value },
    UpstreamClaim { details: Value },
    UpstreamBusiness { status: AppStatus, details: Value },
    MissingRiskToken { response: Value },
    UpstreamComponents { details: Value },
    UpstreamFaceToken { details: Value },
    MissingFinalUrl { response: Value },
    Internal(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidInput(_) | PipelineError::MissingInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::NoAwardsFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::MissingInput(_) => "missing_input",
            PipelineError::UpstreamList { .. } => "upstream_list_error",
            PipelineError::NoAwardsFound { .. } => "no_awards_found",
            PipelineError::UpstreamClaim { .. } => "upstream_claim_error",
            PipelineError::UpstreamBusiness { .. } => "upstream_business_error",
            PipelineError::MissingRiskToken { .. } => "missing_risk_token",
            PipelineError::UpstreamComponents { .. } => "upstream_components_error",
            PipelineError::UpstreamFaceToken { .. } => "upstream_face_token_error",
            PipelineError::MissingFinalUrl { .. } => "missing_final_url",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    /// Raw upstream body worth handing back to the caller, with the field name it goes under.
    pub fn upstream_body(&self) -> Option<(&'static str, &Value)> {
        match self {
            PipelineError::UpstreamList { details }
            | PipelineError::NoAwardsFound { details }
            | PipelineError::UpstreamClaim { details }
            | PipelineError::UpstreamBusiness { details, .. }
            | PipelineError::UpstreamComponents { details }
            | PipelineError::UpstreamFaceToken { details } => Some(("details", details)),
            PipelineError::MissingRiskToken { response } | PipelineError::MissingFinalUrl { response } => {
                Some(("response", response))
            }
            PipelineError::InvalidInput(_) | PipelineError::MissingInput(_) | PipelineError::Internal(_) => None,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidInput(msg) => write!(f, "{}", msg),
            PipelineError::MissingInput(msg) => write!(f, "{}", msg),
            PipelineError::UpstreamList { .. } => write!(f, "List fetch failed"),
            PipelineError::NoAwardsFound { .. } => write!(f, "No awards found"),
            PipelineError::UpstreamClaim { .. } => write!(f, "Award fetch failed"),
            PipelineError::UpstreamBusiness { status, .. } => {
                write!(f, "Award request rejected (ret_code {}): {}", status.code, status.message)
            }
            PipelineError::MissingRiskToken { .. } => write!(f, "No risk_token in award response"),
            PipelineError::UpstreamComponents { .. } => write!(f, "Risk components check failed"),
            PipelineError::UpstreamFaceToken { .. } => write!(f, "Face token fetch failed"),
            PipelineError::MissingFinalUrl { .. } => write!(f, "No final URL in face token response"),
            PipelineError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<NetworkError> for PipelineError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::InvalidProxy(_) => PipelineError::InvalidInput(err.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for PipelineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Missing => PipelineError::MissingInput("Missing cookies or url".to_string()),
            SessionError::InvalidFormat(_) => PipelineError::InvalidInput(err.to_string()),
        }
    }
}

/// Terminal failure state: what went wrong plus everything traced up to that point.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub log: Vec<String>,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub url: String,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ListAwards,
    ClaimAward,
    ProbeComponents,
    ExchangeFaceToken,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::ListAwards => "list-awards",
            Step::ClaimAward => "claim-award",
            Step::ProbeComponents => "probe-components",
            Step::ExchangeFaceToken => "exchange-face-token",
        }
    }
}

/// Steps to run for this context: listing only without a caller-chosen award,
/// the components probe only when enabled.
pub fn plan(ctx: &PipelineContext, options: &PipelineOptions) -> Vec<Step> {
    let mut steps = Vec::with_capacity(4);
    if ctx.award.is_none() {
        steps.push(Step::ListAwards);
    }
    steps.push(Step::ClaimAward);
    if options.probe_components {
        steps.push(Step::ProbeComponents);
    }
    steps.push(Step::ExchangeFaceToken);
    steps
}

pub struct TokenPipeline<'a> {
    upstream: &'a UpstreamClient,
    options: &'a PipelineOptions,
}

impl<'a> TokenPipeline<'a> {
    pub fn new(upstream: &'a UpstreamClient, options: &'a PipelineOptions) -> Self {
        TokenPipeline { upstream, options }
    }

    pub async fn run(&self, mut ctx: PipelineContext) -> Result<PipelineOutcome, PipelineFailure> {
        for step in plan(&ctx, self.options) {
            if let Err(error) = self.run_step(step, &mut ctx).await {
                ctx.log(format!("Step {} failed: {}", step.name(), error));
                return Err(PipelineFailure { error, log: ctx.trace.into_entries() });
            }
        }

        match ctx.final_url.take() {
            Some(url) => {
                ctx.log("Final URL obtained");
                Ok(PipelineOutcome { url, log: ctx.trace.into_entries() })
            }
            None => Err(PipelineFailure {
                error: PipelineError::Internal("pipeline finished without a final URL".to_string()),
                log: ctx.trace.into_entries(),
            }),
        }
    }

    async fn run_step(&self, step: Step, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        match step {
            Step::ListAwards => self.list_awards(ctx).await,
            Step::ClaimAward => self.claim_award(ctx).await,
            Step::ProbeComponents => self.probe_components(ctx).await,
            Step::ExchangeFaceToken => self.exchange_face_token(ctx).await,
        }
    }

    async fn list_awards(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        ctx.log("No awardId, fetching list...");
        let res = self.upstream.post_json(LIST_AWARDS_PATH, &list_request_body(), &ctx.cookies, &[]).await?;
        log_response(ctx, "List", &res);
        if res.status != StatusCode::OK || !app_status::is_success(&res.body) {
            return Err(PipelineError::UpstreamList { details: res.body });
        }

        let selector = select_first_award(res.body)?;
        ctx.log(format!(
            "Selected awardId: {}, specCode: {}",
            selector.award_id,
            selector.spec_code.as_ref().map(AwardValue::to_string).unwrap_or_default()
        ));
        ctx.award = Some(selector);
        Ok(())
    }

    async fn claim_award(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let selector = ctx
            .award
            .clone()
            .ok_or_else(|| PipelineError::Internal("no award selected before claim".to_string()))?;
        ctx.log("Fetching award...");
        let body = json!({
            "awardID": selector.award_id,
            "spec_code": selector.spec_code,
            "is_reward_hub": true,
        });
        let res = self.upstream.post_json(CLAIM_AWARD_PATH, &body, &ctx.cookies, &[]).await?;
        log_response(ctx, "Award", &res);
        if res.status != StatusCode::OK {
            return Err(PipelineError::UpstreamClaim { details: res.body });
        }
        if let Some(status) = app_status::app_status(&res.body) {
            if status.code == self.options.benign_ret_code {
                ctx.log(format!("Award ret_code {} ({}) treated as non-fatal", status.code, status.message));
            } else if status.code != 0 {
                return Err(PipelineError::UpstreamBusiness { status, details: res.body });
            }
        }

        let risk_token = extract_risk_token(&res.body)
            .ok_or_else(|| PipelineError::MissingRiskToken { response: res.body.clone() })?;
        ctx.log(format!("Risk token: {}", utils::truncate_chars(&risk_token, RISK_TOKEN_PREVIEW_CHARS)));
        ctx.risk_token = Some(risk_token);
        Ok(())
    }

    async fn probe_components(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let body = json!({ "risk_token": current_risk_token(ctx)? });
        ctx.log("Checking risk components...");
        let res = self.upstream.post_json(RISK_COMPONENTS_PATH, &body, &ctx.cookies, &[]).await?;
        log_response(ctx, "Components", &res);
        if res.status != StatusCode::OK || !app_status::is_success(&res.body) {
            return Err(PipelineError::UpstreamComponents { details: res.body });
        }
        Ok(())
    }

    async fn exchange_face_token(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let body = json!({ "risk_token": current_risk_token(ctx)? });
        ctx.log("Fetching face token...");
        let res = self
            .upstream
            .post_json(FACE_TOKEN_PATH, &body, &ctx.cookies, &[("platform", "pc")])
            .await?;
        log_response(ctx, "Face token", &res);
        if res.status != StatusCode::OK || !app_status::is_success(&res.body) {
            return Err(PipelineError::UpstreamFaceToken { details: res.body });
        }

        let final_url = extract_final_url(&res.body)
            .ok_or_else(|| PipelineError::MissingFinalUrl { response: res.body.clone() })?;
        ctx.final_url = Some(final_url);
        Ok(())
    }
}

fn current_risk_token(ctx: &PipelineContext) -> Result<String, PipelineError> {
    ctx.risk_token
        .clone()
        .ok_or_else(|| PipelineError::Internal("no risk token before verification".to_string()))
}

fn log_response(ctx: &mut PipelineContext, label: &str, res: &UpstreamResponse) {
    ctx.log(format!("{} status: {}", label, res.status.as_u16()));
    if res.body.get("raw").is_some() {
        let content_type = res.headers.get("content-type").map(String::as_str).unwrap_or("unknown");
        ctx.log(format!("{} body is not JSON (content-type: {})", label, content_type));
    }
}

/// Fixed first-page query of the award listing endpoint.
pub fn list_request_body() -> Value {
    json!({
        "pagination": { "pageNum": 1, "pageSize": 12 },
        "filter": {
            "awardType": "AWARD_TYPE_UNKNOWN",
            "newOrderWay": true,
            "rewardBusinessLine": "REWARD_BUSINESS_LINE_DEFAULT",
            "rewardStatus": "REWARD_STATUS_DEFAULT",
            "getFirstAwardings": false,
            "simpleField": true,
            "allow_amount_multiple": true,
            "return_reward_packet": true,
            "return_transfer_award": true
        }
    })
}

/// Picks the first award of a listing response. An empty or absent list is `NoAwardsFound`.
pub fn select_first_award(body: Value) -> Result<AwardSelector, PipelineError> {
    let first = match body.pointer("/result/awardings/0") {
        Some(first) => first,
        None => return Err(PipelineError::NoAwardsFound { details: body }),
    };
    let award_id = match first.pointer("/award_detail/id").and_then(AwardValue::from_json) {
        Some(id) => id,
        None => return Err(PipelineError::UpstreamList { details: body }),
    };
    let spec_code = first.get("spec_code").and_then(AwardValue::from_json);
    Ok(AwardSelector { award_id, spec_code })
}

/// Risk token from `result.risk_token`, else the top-level `risk_token`.
pub fn extract_risk_token(body: &Value) -> Option<String> {
    body.pointer("/result/risk_token")
        .and_then(non_empty_str)
        .or_else(|| body.get("risk_token").and_then(non_empty_str))
}

pub fn extract_final_url(body: &Value) -> Option<String> {
    body.pointer("/result/token_info/token").and_then(non_empty_str)
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COOKIES: &str = "a=1; b=2";
    const FINAL_URL: &str = "https://verify.example/x";

    fn context(award: Option<AwardSelector>) -> PipelineContext {
        PipelineContext::new(COOKIES.to_string(), award, TraceLog::default())
    }

    fn aw1() -> Option<AwardSelector> {
        Some(AwardSelector { award_id: AwardValue(json!("AW1")), spec_code: None })
    }

    fn client_for(server: &MockServer) -> UpstreamClient {
        UpstreamClient::new(&Url::parse(&server.uri()).unwrap(), None).unwrap()
    }

    async fn mount_json(server: &MockServer, route: &str, status: u16, body: Value, calls: u64) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(calls)
            .mount(server)
            .await;
    }

    fn face_ok() -> Value {
        json!({"ret_code": 0, "result": {"token_info": {"token": FINAL_URL}}})
    }

    #[test]
    fn plan_skips_listing_when_award_given() {
        let options = PipelineOptions::default();
        assert_eq!(plan(&context(aw1()), &options), vec![Step::ClaimAward, Step::ExchangeFaceToken]);
        assert_eq!(
            plan(&context(None), &options),
            vec![Step::ListAwards, Step::ClaimAward, Step::ExchangeFaceToken]
        );
    }

    #[test]
    fn plan_includes_probe_when_enabled() {
        let options = PipelineOptions { probe_components: true, ..PipelineOptions::default() };
        assert_eq!(
            plan(&context(aw1()), &options),
            vec![Step::ClaimAward, Step::ProbeComponents, Step::ExchangeFaceToken]
        );
    }

    #[test]
    fn first_award_is_selected() {
        let body = json!({"result": {"awardings": [
            {"award_detail": {"id": 17}, "spec_code": "SPEC-A"},
            {"award_detail": {"id": 18}, "spec_code": "SPEC-B"}
        ]}});
        let selector = select_first_award(body).unwrap();
        assert_eq!(selector.award_id.as_json(), &json!(17));
        assert_eq!(selector.award_id.to_string(), "17");
        assert_eq!(selector.spec_code.map(|code| code.to_string()).as_deref(), Some("SPEC-A"));
    }

    #[test]
    fn missing_spec_code_defaults_to_none() {
        let body = json!({"result": {"awardings": [{"award_detail": {"id": "AW9"}}]}});
        assert_eq!(select_first_award(body).unwrap().spec_code, None);
    }

    #[test]
    fn award_values_keep_strings_and_numbers_only() {
        assert_eq!(AwardValue::from_json(&json!("AW1")).unwrap().as_json(), &json!("AW1"));
        assert_eq!(AwardValue::from_json(&json!(42)).unwrap().as_json(), &json!(42));
        assert_eq!(AwardValue::from_json(&json!("")), None);
        assert_eq!(AwardValue::from_json(&json!(true)), None);
        assert_eq!(AwardValue::from_json(&json!({"id": 1})), None);
    }

    #[test]
    fn empty_listing_is_no_awards_found() {
        let body = json!({"ret_code": 0, "result": {"awardings": []}});
        match select_first_award(body.clone()) {
            Err(PipelineError::NoAwardsFound { details }) => assert_eq!(details, body),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn risk_token_found_in_either_location() {
        assert_eq!(extract_risk_token(&json!({"result": {"risk_token": "nested"}})).as_deref(), Some("nested"));
        assert_eq!(extract_risk_token(&json!({"risk_token": "top"})).as_deref(), Some("top"));
        assert_eq!(
            extract_risk_token(&json!({"result": {"risk_token": ""}, "risk_token": "top"})).as_deref(),
            Some("top")
        );
        assert_eq!(extract_risk_token(&json!({"result": {}})), None);
    }

    #[test]
    fn error_kinds_map_to_http_statuses() {
        assert_eq!(PipelineError::MissingInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PipelineError::InvalidInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PipelineError::NoAwardsFound { details: json!({}) }.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            PipelineError::MissingRiskToken { response: json!({}) }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(PipelineError::Internal("x".into()).upstream_body(), None);
    }

    #[tokio::test]
    async fn given_award_skips_listing_and_returns_final_url() {
        let server = MockServer::start().await;
        mount_json(&server, LIST_AWARDS_PATH, 200, json!({}), 0).await;
        Mock::given(method("POST"))
            .and(path(CLAIM_AWARD_PATH))
            .and(header("cookie", COOKIES))
            .and(body_json(json!({"awardID": "AW1", "spec_code": null, "is_reward_hub": true})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ret_code": 0, "result": {"risk_token": "rt-1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(FACE_TOKEN_PATH))
            .and(header("platform", "pc"))
            .and(body_json(json!({"risk_token": "rt-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(face_ok()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let outcome = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap();

        assert_eq!(outcome.url, FINAL_URL);
        assert!(outcome.log.iter().any(|l| l.starts_with("Risk token: rt-1")));
        assert_eq!(outcome.log.last().map(String::as_str), Some("Final URL obtained"));
    }

    #[tokio::test]
    async fn discovers_award_from_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LIST_AWARDS_PATH))
            .and(body_json(list_request_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ret_code": 0,
                "result": {"awardings": [{"award_detail": {"id": "AW7"}, "spec_code": "S1"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CLAIM_AWARD_PATH))
            .and(body_json(json!({"awardID": "AW7", "spec_code": "S1", "is_reward_hub": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"risk_token": "rt-7"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let outcome = TokenPipeline::new(&client, &options).run(context(None)).await.unwrap();

        assert_eq!(outcome.url, FINAL_URL);
        assert!(outcome.log.iter().any(|l| l == "Selected awardId: AW7, specCode: S1"));
    }

    #[tokio::test]
    async fn numeric_listing_id_is_claimed_as_number() {
        let server = MockServer::start().await;
        mount_json(
            &server,
            LIST_AWARDS_PATH,
            200,
            json!({"ret_code": 0, "result": {"awardings": [{"award_detail": {"id": 17}, "spec_code": "S"}]}}),
            1,
        )
        .await;
        Mock::given(method("POST"))
            .and(path(CLAIM_AWARD_PATH))
            .and(body_json(json!({"awardID": 17, "spec_code": "S", "is_reward_hub": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"risk_token": "rt-17"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let outcome = TokenPipeline::new(&client, &options).run(context(None)).await.unwrap();

        assert_eq!(outcome.url, FINAL_URL);
        assert!(outcome.log.iter().any(|l| l == "Selected awardId: 17, specCode: S"));
    }

    #[tokio::test]
    async fn null_snake_case_code_does_not_hide_camel_case_failure() {
        let server = MockServer::start().await;
        mount_json(
            &server,
            CLAIM_AWARD_PATH,
            200,
            json!({"ret_code": null, "retCode": 10001, "retMsg": "expired", "result": {"risk_token": "rt"}}),
            1,
        )
        .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        match failure.error {
            PipelineError::UpstreamBusiness { status, .. } => assert_eq!(status.code, 10001),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreadable_claim_code_is_a_business_error() {
        let server = MockServer::start().await;
        mount_json(
            &server,
            CLAIM_AWARD_PATH,
            200,
            json!({"ret_code": "ERR_EXPIRED", "result": {"risk_token": "rt"}}),
            1,
        )
        .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::UpstreamBusiness { .. }));
    }

    #[tokio::test]
    async fn empty_listing_stops_before_claim() {
        let server = MockServer::start().await;
        let listing = json!({"ret_code": 0, "result": {"awardings": []}});
        mount_json(&server, LIST_AWARDS_PATH, 200, listing.clone(), 1).await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({}), 0).await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(None)).await.unwrap_err();

        assert_eq!(failure.error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(failure.error.upstream_body(), Some(("details", &listing)));
        assert!(failure.log.iter().any(|l| l == "List status: 200"));
    }

    #[tokio::test]
    async fn listing_business_error_fails() {
        let server = MockServer::start().await;
        mount_json(&server, LIST_AWARDS_PATH, 200, json!({"retCode": 10007, "retMsg": "not logged in"}), 1).await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({}), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(None)).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::UpstreamList { .. }));
    }

    #[tokio::test]
    async fn benign_claim_code_continues_to_face_token() {
        let server = MockServer::start().await;
        mount_json(
            &server,
            CLAIM_AWARD_PATH,
            200,
            json!({"ret_code": ALREADY_CLAIMED_RET_CODE, "ret_msg": "already claimed", "result": {"risk_token": "rt-2"}}),
            1,
        )
        .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let outcome = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap();

        assert_eq!(outcome.url, FINAL_URL);
    }

    #[tokio::test]
    async fn other_claim_codes_are_business_errors() {
        let server = MockServer::start().await;
        mount_json(
            &server,
            CLAIM_AWARD_PATH,
            200,
            json!({"retCode": 10001, "retMsg": "award expired", "result": {"risk_token": "rt-3"}}),
            1,
        )
        .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        match failure.error {
            PipelineError::UpstreamBusiness { status, .. } => {
                assert_eq!(status.code, 10001);
                assert_eq!(status.message, "award expired");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn claim_http_error_fails() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 502, json!({"error": "bad gateway"}), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::UpstreamClaim { .. }));
        assert!(failure.log.iter().any(|l| l == "Award status: 502"));
        assert!(failure.log.last().unwrap().starts_with("Step claim-award failed"));
    }

    #[tokio::test]
    async fn claim_without_risk_token_fails() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({"ret_code": 0, "result": {}}), 1).await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::MissingRiskToken { .. }));
        assert_eq!(failure.error.upstream_body().map(|(field, _)| field), Some("response"));
    }

    #[tokio::test]
    async fn malformed_claim_body_surfaces_as_raw() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CLAIM_AWARD_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert_eq!(failure.error.upstream_body(), Some(("details", &json!({"raw": "<html>oops</html>"}))));
    }

    #[tokio::test]
    async fn components_probe_runs_between_claim_and_face_token() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({"result": {"risk_token": "rt-4"}}), 1).await;
        Mock::given(method("POST"))
            .and(path(RISK_COMPONENTS_PATH))
            .and(body_json(json!({"risk_token": "rt-4"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"retCode": 0})))
            .expect(1)
            .mount(&server)
            .await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions { probe_components: true, ..PipelineOptions::default() };
        let outcome = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap();

        assert_eq!(outcome.url, FINAL_URL);
        assert!(outcome.log.iter().any(|l| l == "Components status: 200"));
    }

    #[tokio::test]
    async fn failed_components_probe_stops_pipeline() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({"result": {"risk_token": "rt-5"}}), 1).await;
        mount_json(&server, RISK_COMPONENTS_PATH, 200, json!({"retCode": 30001, "retMsg": "risk"}), 1).await;
        mount_json(&server, FACE_TOKEN_PATH, 200, face_ok(), 0).await;

        let client = client_for(&server);
        let options = PipelineOptions { probe_components: true, ..PipelineOptions::default() };
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::UpstreamComponents { .. }));
    }

    #[tokio::test]
    async fn face_token_without_url_fails() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({"result": {"risk_token": "rt-6"}}), 1).await;
        mount_json(&server, FACE_TOKEN_PATH, 200, json!({"ret_code": 0, "result": {"token_info": {}}}), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::MissingFinalUrl { .. }));
    }

    #[tokio::test]
    async fn face_token_business_error_fails() {
        let server = MockServer::start().await;
        mount_json(&server, CLAIM_AWARD_PATH, 200, json!({"result": {"risk_token": "rt-8"}}), 1).await;
        mount_json(&server, FACE_TOKEN_PATH, 200, json!({"ret_code": 10002, "result": {}}), 1).await;

        let client = client_for(&server);
        let options = PipelineOptions::default();
        let failure = TokenPipeline::new(&client, &options).run(context(aw1())).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::UpstreamFaceToken { .. }));
    }
}
