//! Schema upgrades for persisted task records.
//!
//! Each step rewrites the raw JSON of one version into the next and runs
//! once, when a record is loaded. Business logic only ever sees the current
//! schema.
//!
//! - v1 -> v2: comma-joined `*_ids` strings become lists.
//! - v2 -> v3: the singular `output_id` folds into `output_ids`.

use serde_json::{Map, Value};

use crate::core::{framework_keys, CURRENT_TASK_SCHEMA};
use crate::{Error, Result};

const LEGACY_OUTPUT_ID: &str = "output_id";

/// Upgrade a raw task record to the current schema.
///
/// Returns the upgraded value and whether anything changed. Records
/// without a `schema_version` are treated as version 1.
pub fn upgrade_task(mut value: Value) -> Result<(Value, bool)> {
    let found = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .filter(|v| *v > 0)
        .unwrap_or(1);

    if found > CURRENT_TASK_SCHEMA {
        return Err(Error::UnsupportedSchema {
            found,
            supported: CURRENT_TASK_SCHEMA,
        });
    }
    if found == CURRENT_TASK_SCHEMA {
        return Ok((value, false));
    }

    let mut version = found;
    while version < CURRENT_TASK_SCHEMA {
        match version {
            1 => split_id_lists(&mut value),
            2 => fold_output_id(&mut value),
            _ => {}
        }
        version += 1;
    }

    if let Some(record) = value.as_object_mut() {
        record.insert("schema_version".to_string(), Value::from(CURRENT_TASK_SCHEMA));
    }
    tracing::debug!(from = found, to = CURRENT_TASK_SCHEMA, "Upgraded task record");
    Ok((value, true))
}

fn namespace_mut<'a>(value: &'a mut Value, namespace: &str) -> Option<&'a mut Map<String, Value>> {
    value
        .get_mut("params")?
        .get_mut(namespace)?
        .as_object_mut()
}

fn split_id_lists(value: &mut Value) {
    for namespace in ["tool", "framework"] {
        let Some(params) = namespace_mut(value, namespace) else {
            continue;
        };
        for (key, entry) in params.iter_mut() {
            if !key.ends_with("_ids") {
                continue;
            }
            if let Value::String(joined) = entry {
                let items: Vec<Value> = joined
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| match s.parse::<i64>() {
                        // Artifact ids stay strings; numeric subject ids become numbers.
                        Ok(n) if namespace == "tool" => Value::from(n),
                        _ => Value::String(s.to_string()),
                    })
                    .collect();
                *entry = Value::Array(items);
            }
        }
    }
}

fn fold_output_id(value: &mut Value) {
    let Some(framework) = namespace_mut(value, "framework") else {
        return;
    };
    let Some(legacy) = framework.remove(LEGACY_OUTPUT_ID) else {
        return;
    };
    let Value::String(id) = legacy else {
        return;
    };
    let outputs = framework
        .entry(framework_keys::OUTPUT_IDS.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(ids) = outputs {
        let id = Value::String(id);
        if !ids.contains(&id) {
            ids.insert(0, id);
        }
    }
}
