//! Internal admin API
//!
//! Basic-auth-guarded management surface under `/suresql`: user CRUD
//! against the `_users` table, schema introspection, and the raw engine
//! status. These endpoints run over the node's internal connection, never
//! over a session lease.

use axum::extract::{Query, State};
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use suresql_core::driver::{Filter, ParameterizedSql};
use suresql_core::error::Error;
use suresql_core::node::Node;
use suresql_core::schema::USERS_TABLE;
use suresql_core::validate::validate_user_fields;

use crate::auth::{hash_credential, UserRow};
use crate::routes::{fail_response, ok_response, require_basic, ApiResponse, ServerState};

/// Prefix for the internal surface
pub const INTERNAL_API_PREFIX: &str = "/suresql";

/// Internal admin routes.
pub fn routes(state: ServerState) -> Router<ServerState> {
    let guarded = Router::new()
        .route(
            "/iusers",
            get(handle_list_users)
                .post(handle_create_user)
                .put(handle_update_user)
                .delete(handle_delete_user),
        )
        .route("/schema", get(handle_schema))
        .route("/dbms_status", get(handle_dbms_status))
        .layer(middleware::from_fn_with_state(state, require_basic));

    Router::new().nest(INTERNAL_API_PREFIX, guarded)
}

async fn find_user(node: &Node, username: &str) -> Option<UserRow> {
    let record = node
        .internal_driver()
        .select_one_with_filter(USERS_TABLE, &Filter::leaf("username", "=", username))
        .await
        .ok()?;
    UserRow::from_record(record).ok()
}

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    username: Option<String>,
}

async fn handle_list_users(
    State(state): State<ServerState>,
    Query(query): Query<UserQuery>,
) -> ApiResponse {
    let mut filter = match &query.username {
        Some(name) if !name.is_empty() => Filter::leaf("username", "LIKE", format!("%{name}%")),
        _ => Filter::default(),
    };
    filter.order_by = vec!["username ASC".to_string()];

    let records = match state
        .node
        .internal_driver()
        .select_many_with_filter(USERS_TABLE, &filter)
        .await
    {
        Ok(records) => records,
        Err(e) if e.is_no_rows() => Vec::new(),
        Err(e) => return fail_response(&e, "Failed to list users"),
    };

    let users: Vec<UserRow> = records
        .into_iter()
        .filter_map(|record| UserRow::from_record(record).ok())
        .map(|mut user| {
            // Hashes never leave the node.
            user.password.clear();
            user
        })
        .collect();

    ok_response(
        format!("Users retrieved successfully: {}", users.len()),
        users,
    )
}

#[derive(Debug, Default, Deserialize)]
struct CreateUserRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    role_name: String,
}

async fn handle_create_user(
    State(state): State<ServerState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResponse {
    if req.username.is_empty() || req.password.is_empty() {
        let err = Error::validation("Username and password are required");
        return fail_response(&err, "Invalid user input");
    }
    if let Err(e) = validate_user_fields(&req.username, &req.password, &req.role_name) {
        return fail_response(&e, "Invalid user input");
    }
    if find_user(&state.node, &req.username).await.is_some() {
        let err = Error::conflict("user already exists");
        return fail_response(&err, "User already exists");
    }

    let (api_key, client_id) = state.node.api_credentials();
    let user = UserRow {
        id: 0,
        username: req.username.clone(),
        password: hash_credential(&req.password, &api_key, &client_id),
        role_name: req.role_name.clone(),
        created_at: Some(Utc::now()),
    };
    let record = match user.to_record() {
        Ok(record) => record,
        Err(e) => return fail_response(&e, "Failed to create user record"),
    };

    match state
        .node
        .internal_driver()
        .insert_one_record(&record, false)
        .await
    {
        Ok(tally) => ok_response(
            "User created successfully",
            json!({
                "id": tally.last_insert_id.to_string(),
                "username": req.username,
                "role": req.role_name,
            }),
        ),
        Err(e) => fail_response(&e, "Failed to create user"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct UpdateUserRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    new_username: String,
    #[serde(default)]
    new_password: String,
    #[serde(default)]
    new_role_name: String,
}

async fn handle_update_user(
    State(state): State<ServerState>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResponse {
    if req.username.is_empty() {
        let err = Error::validation("Username is required");
        return fail_response(&err, "Invalid user input");
    }
    if req.new_username.is_empty() && req.new_password.is_empty() && req.new_role_name.is_empty() {
        let err = Error::validation("No update fields provided");
        return fail_response(&err, "Invalid user input");
    }
    if let Err(e) = validate_user_fields(
        &req.username,
        &req.new_password,
        &req.new_role_name,
    ) {
        return fail_response(&e, "Invalid user input");
    }

    let Some(mut user) = find_user(&state.node, &req.username).await else {
        let err = Error::not_found("user not found");
        return fail_response(&err, "User not found");
    };
    user.password.clear();

    let mut assignments = Vec::new();
    let mut values = Vec::new();

    if !req.new_username.is_empty() && req.new_username != req.username {
        if find_user(&state.node, &req.new_username).await.is_some() {
            let err = Error::conflict("new username already exists");
            return fail_response(&err, "New username already exists");
        }
        assignments.push("username = ?");
        values.push(serde_json::Value::from(req.new_username.clone()));
    }
    if !req.new_password.is_empty() {
        let (api_key, client_id) = state.node.api_credentials();
        assignments.push("password = ?");
        values.push(serde_json::Value::from(hash_credential(
            &req.new_password,
            &api_key,
            &client_id,
        )));
    }
    if !req.new_role_name.is_empty() && req.new_role_name != user.role_name {
        assignments.push("role_name = ?");
        values.push(serde_json::Value::from(req.new_role_name.clone()));
    }
    if assignments.is_empty() {
        return ok_response("No changes provided", serde_json::Value::Null);
    }

    let sql = format!(
        "UPDATE {USERS_TABLE} SET {} WHERE username = ?",
        assignments.join(", ")
    );
    values.push(serde_json::Value::from(req.username.clone()));

    match state
        .node
        .internal_driver()
        .exec_one_sql_parameterized(&ParameterizedSql::new(sql, values))
        .await
    {
        Ok(_) => ok_response("User updated successfully", user),
        Err(e) => fail_response(&e, "Failed to update user"),
    }
}

async fn handle_delete_user(
    State(state): State<ServerState>,
    Query(query): Query<UserQuery>,
) -> ApiResponse {
    let Some(username) = query.username.filter(|u| !u.is_empty()) else {
        let err = Error::validation("Username is required");
        return fail_response(&err, "Invalid user input");
    };
    if find_user(&state.node, &username).await.is_none() {
        let err = Error::not_found(format!("user {username} not found"));
        return fail_response(&err, "User not found");
    }

    let sql = format!("DELETE FROM {USERS_TABLE} WHERE username = ?");
    match state
        .node
        .internal_driver()
        .exec_one_sql_parameterized(&ParameterizedSql::new(
            sql,
            vec![serde_json::Value::from(username.clone())],
        ))
        .await
    {
        Ok(_) => ok_response("User deleted successfully", serde_json::Value::Null),
        Err(e) => fail_response(&e, "Failed to delete user"),
    }
}

async fn handle_schema(State(state): State<ServerState>) -> ApiResponse {
    match state.node.internal_driver().schema(false).await {
        Ok(schema) => ok_response("Schema retrieved successfully", schema),
        Err(e) => fail_response(&e, "Failed to read schema"),
    }
}

async fn handle_dbms_status(State(state): State<ServerState>) -> ApiResponse {
    match state.node.internal_driver().status().await {
        Ok(status) => ok_response("DBMS status retrieved successfully", status),
        Err(e) => fail_response(&e, "Failed to read DBMS status"),
    }
}
