use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::authz::{registry, CacheStats, UnmappedPair};
use crate::models::permission;
use crate::routes::{self, health::HealthResponse};

#[derive(OpenApi)]
#[openapi(
	paths(
		routes::health::health,
		routes::permissions::action_registry,
		routes::permissions::my_permissions,
		routes::permissions::check,
		routes::permissions::get_matrix,
		routes::permissions::update_matrix,
		routes::permissions::cache_stats,
		routes::permissions::invalidate_cache,
		routes::permissions::unmapped_pairs
	),
	components(
		schemas(
			HealthResponse,
			CacheStats,
			UnmappedPair,
			registry::FeatureArea,
			registry::ActionDef,
			registry::FeatureGroup,
			permission::PermissionRecord,
			permission::PermissionKey,
			permission::CanonicalPermission,
			permission::MatrixUpdateRequest,
			permission::ErrorKind,
			permission::FailedChange,
			permission::BatchResult,
			permission::RoleMatrix,
			permission::MatrixView,
			permission::PermissionCheck,
			permission::RolePermissions
		)
	),
	tags(
		(name = "Health", description = "Service health"),
		(name = "Permissions", description = "Permission resolution and matrix editing")
	)
)]
pub struct ApiDoc;

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(&ApiDoc::openapi())?;

	normalize_path_operations(&mut doc);
	ensure_security_components(&mut doc);
	ensure_global_security(&mut doc);
	add_examples(&mut doc);
	ensure_servers(&mut doc, port);

	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> anyhow::Result<Router> {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.with_credentials(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc)?);

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Ok(Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config)))
}

fn normalize_path_operations(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		let snapshot = paths.clone();
		for (path, item) in snapshot {
			if let Some(ops) = item.as_object() {
				let mut normalized = Map::new();
				for (method, val) in ops {
					let key = method.to_lowercase();
					if let Some(existing) = normalized.get_mut(&key) {
						merge_values(existing, val);
					} else {
						normalized.insert(key, val.clone());
					}
				}
				paths.insert(path, Value::Object(normalized));
			}
		}
	}
}

fn ensure_security_components(doc: &mut Value) {
	let Some(root) = doc.as_object_mut() else { return; };

	let components = root
		.entry("components")
		.or_insert_with(|| Value::Object(Map::new()));
	let Some(components) = components.as_object_mut() else { return; };

	let schemes = components
		.entry("securitySchemes")
		.or_insert_with(|| Value::Object(Map::new()));
	let Some(schemes) = schemes.as_object_mut() else { return; };

	schemes.insert(
		"bearerAuth".to_string(),
		json!({
			"type": "http",
			"scheme": "bearer",
			"bearerFormat": "JWT"
		}),
	);
}

fn ensure_global_security(doc: &mut Value) {
	if let Some(root) = doc.as_object_mut() {
		root
			.entry("security")
			.or_insert_with(|| json!([{ "bearerAuth": [] }]));
	}
}

fn add_examples(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		for item in paths.values_mut() {
			if let Some(operations) = item.as_object_mut() {
				for operation in operations.values_mut() {
					apply_request_examples(operation);
					apply_response_examples(operation);
				}
			}
		}
	}
}

fn apply_request_examples(operation: &mut Value) {
	let Some(app_json) = operation
		.pointer_mut("/requestBody/content/application~1json")
		.and_then(Value::as_object_mut)
	else {
		return;
	};

	let reference = app_json
		.get("schema")
		.and_then(|schema| schema.get("$ref"))
		.and_then(Value::as_str);

	let example = match reference {
		Some("#/components/schemas/MatrixUpdateRequest") => Some(json!({
			"changes": [
				{ "role_id": "sales", "resource": "case", "action": "create-case", "allowed": true },
				{ "role_id": "it", "resource": "settings", "action": "email-config", "allowed": true },
				{ "role_id": "driver", "resource": "case", "action": "cancel-case", "allowed": false }
			]
		})),
		_ => None,
	};

	if let Some(example) = example {
		app_json.insert("example".to_string(), example);
	}
}

fn apply_response_examples(operation: &mut Value) {
	let Some(responses) = operation.get_mut("responses").and_then(Value::as_object_mut) else { return; };

	for response in responses.values_mut() {
		let Some(app_json) = response
			.pointer_mut("/content/application~1json")
			.and_then(Value::as_object_mut)
		else {
			continue;
		};

		let reference = app_json
			.get("schema")
			.and_then(|schema| schema.get("$ref"))
			.and_then(Value::as_str);

		let example = match reference {
			Some("#/components/schemas/BatchResult") => Some(json!({
				"succeeded": [
					{ "role_id": "sales", "resource": "case", "action": "create-case" },
					{ "role_id": "it", "resource": "settings", "action": "email-config" }
				],
				"failed": [{
					"key": { "role_id": "driver", "resource": "case", "action": "cancel-case" },
					"error_kind": "store_unavailable",
					"message": "permission store unavailable: database is locked"
				}]
			})),
			Some("#/components/schemas/PermissionCheck") => Some(json!({
				"role_id": "it",
				"action_id": "email-config",
				"allowed": true
			})),
			Some("#/components/schemas/CacheStats") => Some(json!({
				"warm": true,
				"roles": 6,
				"fetches": 3,
				"generation": 2
			})),
			_ => None,
		};

		if let Some(example) = example {
			app_json.insert("example".to_string(), example);
		}
	}
}

fn ensure_servers(doc: &mut Value, port: u16) {
	let server_url = format!("http://localhost:{}", port);

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

fn merge_values(target: &mut Value, addition: &Value) {
	match (target, addition) {
		(Value::Object(dest), Value::Object(src)) => {
			for (key, value) in src {
				if let Some(existing) = dest.get_mut(key) {
					merge_values(existing, value);
				} else {
					dest.insert(key.clone(), value.clone());
				}
			}
		}
		(Value::Array(dest), Value::Array(src)) => {
			for item in src {
				if !dest.contains(item) {
					dest.push(item.clone());
				}
			}
		}
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn document_lists_permission_routes_with_bearer_auth() {
		let doc = serde_json::to_value(build_openapi(8000).unwrap()).unwrap();

		for path in ["/api/health", "/permissions/matrix", "/permissions/check/{action_id}"] {
			assert!(doc["paths"].get(path).is_some(), "missing {path}");
		}
		assert!(doc["paths"]["/permissions/matrix"].get("put").is_some());
		assert_eq!(doc["components"]["securitySchemes"]["bearerAuth"]["scheme"], "bearer");
		assert_eq!(doc["servers"][0]["url"], "http://localhost:8000");
	}
}
