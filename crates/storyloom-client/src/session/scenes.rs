use std::collections::{HashMap, HashSet};

use serde_json::Value;
use storyloom_proto::fields;
use storyloom_proto::{Artifact, Record, Scene};

/// Rebuilds the scene projection from every scene-typed artifact. Each field
/// takes the value from its most recent write across all artifacts, so a sparse
/// update to one artifact never revives its older values of other fields.
/// Scenes keep the order in which they were first seen.
pub fn derive_scenes(artifacts: &[Artifact], scene_types: &HashSet<String>) -> Vec<Scene> {
    let mut ordered: Vec<&Artifact> = artifacts
        .iter()
        .filter(|artifact| scene_types.contains(&artifact.artifact_type))
        .collect();
    ordered.sort_by_key(|artifact| artifact.revision);

    let mut scenes: Vec<Scene> = Vec::new();
    let mut written: Vec<HashMap<String, u64>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for artifact in ordered {
        let (records, listed) = scene_records(&artifact.payload);
        for record in records {
            let Some(id) = fields::get_id(record, &["scene_id", "id"]) else {
                continue;
            };
            let slot = *index.entry(id.clone()).or_insert_with(|| {
                scenes.push(Scene::new(id));
                written.push(HashMap::new());
                scenes.len() - 1
            });
            let mut winners = Record::new();
            for (key, value) in record {
                if value.is_null() {
                    continue;
                }
                let stamped = if listed { "scenes" } else { key.as_str() };
                let revision = artifact.field_revision(stamped);
                let newest = written[slot].entry(key.clone()).or_insert(0);
                if revision >= *newest {
                    *newest = revision;
                    winners.insert(key.clone(), value.clone());
                }
            }
            scenes[slot].absorb(&winners);
        }
    }
    scenes
}

/// A payload describes one scene, or several under a `scenes` list.
fn scene_records(payload: &Record) -> (Vec<&Record>, bool) {
    match payload.get("scenes") {
        Some(Value::Array(items)) => (items.iter().filter_map(fields::as_record).collect(), true),
        _ => (vec![payload], false),
    }
}
