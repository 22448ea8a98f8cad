//! Backup policy API: retention plus the ordered copy rules that drive
//! 3-2-1 replication.

use chrono::Utc;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::ApiError;
use crate::db::queries;
use crate::db::tables::{BackupPolicy, CopyRule};
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct CopyRuleBody {
    pub destination_repository_id: String,
    #[serde(default = "default_mode")]
    pub mode: String, // 'immediate' | 'scheduled' | 'manual'
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub verify_after_copy: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyBody {
    pub name: String,
    #[serde(default)]
    pub retention_days: i32,
    pub primary_repository_id: String,
    #[serde(default)]
    pub copy_rules: Vec<CopyRuleBody>,
}

fn default_mode() -> String {
    "immediate".to_string()
}

fn default_true() -> bool {
    true
}

#[post("/policies", format = "json", data = "<body>")]
pub async fn create_policy(
    state: &State<EngineState>,
    body: Json<CreatePolicyBody>,
) -> Result<Json<Value>, ApiError> {
    if queries::repository::get_repository(&state.pool, &body.primary_repository_id)
        .await?
        .is_none()
    {
        return Err(ApiError::bad_request(format!(
            "primary repository not found: {}",
            body.primary_repository_id
        )));
    }

    for rule in &body.copy_rules {
        if !matches!(rule.mode.as_str(), "immediate" | "scheduled" | "manual") {
            return Err(ApiError::bad_request(format!("invalid copy mode: {}", rule.mode)));
        }
        if queries::repository::get_repository(&state.pool, &rule.destination_repository_id)
            .await?
            .is_none()
        {
            return Err(ApiError::bad_request(format!(
                "destination repository not found: {}",
                rule.destination_repository_id
            )));
        }
    }

    let policy = BackupPolicy {
        id: format!("policy-{}", &Uuid::new_v4().simple().to_string()[..12]),
        name: body.name.clone(),
        retention_days: body.retention_days,
        primary_repository_id: body.primary_repository_id.clone(),
        created_at: Utc::now(),
    };
    queries::policy::create_policy(&state.pool, &policy).await?;

    let mut rules = Vec::with_capacity(body.copy_rules.len());
    for rule_body in &body.copy_rules {
        let rule = CopyRule {
            id: format!("rule-{}", &Uuid::new_v4().simple().to_string()[..12]),
            policy_id: policy.id.clone(),
            destination_repository_id: rule_body.destination_repository_id.clone(),
            mode: rule_body.mode.clone(),
            priority: rule_body.priority,
            verify_after_copy: rule_body.verify_after_copy,
            enabled: true,
        };
        queries::policy::create_rule(&state.pool, &rule).await?;
        rules.push(rule);
    }

    Ok(Json(json!({ "policy": policy, "copy_rules": rules })))
}

#[get("/policies/<policy_id>")]
pub async fn get_policy(
    state: &State<EngineState>,
    policy_id: &str,
) -> Result<Json<Value>, ApiError> {
    let policy = queries::policy::get_policy(&state.pool, policy_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("policy not found: {}", policy_id)))?;

    let rules = queries::policy::list_enabled_rules(&state.pool, policy_id).await?;
    Ok(Json(json!({ "policy": policy, "copy_rules": rules })))
}
