// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Observation digesting.
//!
//! `obs_digest` is assembled from per-component digests:
//! `sha256(join(sorted(present component digests)))`. UI and notification
//! components are canonicalized first (stable element ordering, timestamp
//! bucketing, volatile-field redaction) so that dumpsys jitter between two
//! otherwise identical observations does not change the digest. Volatile
//! components (notifications) are excluded unless the case opts in.

use crate::device::Observation;
use crate::digest::{sha256_bytes, stable_sha256};
use crate::error::HarnessResult;
use crate::evidence::records::ObsComponentDigests;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const OBS_DIGEST_VERSION: &str = "v1_sorted_components";

const TEXT_PREVIEW_MAX: usize = 120;
const NOTIFICATION_TS_BUCKET_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct UiElement {
    pub bbox: [i64; 4],
    pub resource_id: Option<String>,
    pub text: Option<String>,
    pub package: Option<String>,
    pub class_name: Option<String>,
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn parse_bbox(v: &Value) -> Option<[i64; 4]> {
    if let Some(arr) = v.as_array() {
        if arr.len() == 4 {
            let mut out = [0i64; 4];
            for (i, item) in arr.iter().enumerate() {
                out[i] = item.as_i64()?;
            }
            return Some(out);
        }
    }
    // uiautomator form: "[l,t][r,b]"
    let s = v.as_str()?;
    let parts: Vec<i64> = s
        .split(['[', ']', ','])
        .filter(|p| !p.is_empty())
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.len() == 4 {
        Some([parts[0], parts[1], parts[2], parts[3]])
    } else {
        None
    }
}

fn nonempty(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn walk_ui_tree(node: &Value, default_package: Option<&str>, out: &mut Vec<UiElement>) {
    if let Some(obj) = node.as_object() {
        let bbox = obj
            .get("bbox")
            .or_else(|| obj.get("bounds"))
            .and_then(parse_bbox);
        if let Some(bbox) = bbox {
            out.push(UiElement {
                bbox,
                resource_id: nonempty(node, "resource_id")
                    .or_else(|| nonempty(node, "resource-id")),
                text: nonempty(node, "text").map(|t| truncate(&t, TEXT_PREVIEW_MAX)),
                package: nonempty(node, "package")
                    .or_else(|| default_package.map(str::to_string)),
                class_name: nonempty(node, "class").or_else(|| nonempty(node, "class_name")),
            });
        }
        for key in ["children", "nodes"] {
            if let Some(children) = obj.get(key).and_then(Value::as_array) {
                for child in children {
                    walk_ui_tree(child, default_package, out);
                }
            }
        }
    } else if let Some(arr) = node.as_array() {
        for item in arr {
            walk_ui_tree(item, default_package, out);
        }
    }
}

/// Extract and canonicalize UI elements from an accessibility tree:
/// sorted by `(bbox, resource_id, text, package)`, text truncated,
/// volatile attributes dropped.
pub fn canonical_ui_elements(ui_tree: &Value, default_package: Option<&str>) -> Vec<UiElement> {
    let mut out = Vec::new();
    walk_ui_tree(ui_tree, default_package, &mut out);
    out.sort();
    out.dedup();
    out
}

/// Canonicalize notifications to a jitter-free shape: package, bucketed
/// post time and a text length bucket. Titles and bodies never appear.
pub fn canonical_notifications(notifications: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = notifications
        .iter()
        .filter_map(|n| {
            let package = nonempty(n, "package")?;
            let when_bucket = n
                .get("when_ms")
                .or_else(|| n.get("post_time_ms"))
                .and_then(Value::as_u64)
                .map(|ts| ts / NOTIFICATION_TS_BUCKET_MS);
            let text_len = n
                .get("text")
                .and_then(Value::as_str)
                .map(|t| t.len())
                .unwrap_or(0);
            Some(json!({
                "package": package,
                "when_bucket": when_bucket,
                "text_len_bucket": length_bucket(text_len),
            }))
        })
        .collect();
    out.sort_by_key(|v| crate::digest::canonical_json(v).unwrap_or_default());
    out
}

pub fn length_bucket(n: usize) -> &'static str {
    match n {
        0 => "0",
        1..=16 => "1-16",
        17..=64 => "17-64",
        65..=256 => "65-256",
        _ => ">256",
    }
}

/// Compute the per-component digests and the combined `obs_digest` for one
/// observation. Returns `None` for the combined digest when a required
/// component (foreground) cannot be derived.
pub fn compute_obs_digests(
    observation: &Observation,
    include_volatile: bool,
) -> HarnessResult<(ObsComponentDigests, Option<String>)> {
    let screenshot_digest = observation
        .screenshot_png
        .as_deref()
        .map(sha256_bytes);

    let fg = &observation.foreground;
    let foreground_digest = Some(sha256_bytes(
        format!(
            "{}{}",
            fg.package.as_deref().unwrap_or(""),
            fg.activity.as_deref().unwrap_or("")
        )
        .as_bytes(),
    ));

    let geometry_digest = Some(stable_sha256(&json!({
        "screenshot_size_px": observation.geometry.screenshot_size_px,
        "logical_screen_size_px": observation.geometry.logical_screen_size_px,
        "physical_frame_boundary_px": observation.geometry.physical_frame_boundary_px,
        "orientation": observation.geometry.orientation,
    }))?);

    let ui_elements_digest = match &observation.ui_tree {
        Some(tree) => {
            let elements = canonical_ui_elements(tree, fg.package.as_deref());
            if elements.is_empty() {
                None
            } else {
                Some(stable_sha256(&elements)?)
            }
        }
        None => None,
    };

    let notifications_digest = if include_volatile && !observation.notifications.is_empty() {
        let canonical = canonical_notifications(&observation.notifications);
        if canonical.is_empty() {
            None
        } else {
            Some(stable_sha256(&canonical)?)
        }
    } else {
        None
    };

    let components = ObsComponentDigests {
        screenshot_digest,
        ui_dump_digest: None,
        ui_elements_digest,
        foreground_digest,
        geometry_digest,
        notifications_digest,
        clipboard_digest: None,
    };

    let obs_digest = Some(combine_components(&components));
    Ok((components, obs_digest))
}

/// `obs_digest = sha256(join(sorted(component_digests)))`.
pub fn combine_components(components: &ObsComponentDigests) -> String {
    let joined = components.present_sorted().join("\n");
    sha256_bytes(joined.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ForegroundApp, Observation, ScreenGeometry};
    use serde_json::json;

    fn observation(notifications: Vec<Value>) -> Observation {
        Observation {
            screenshot_png: Some(b"\x89PNG-data".to_vec()),
            ui_tree: Some(json!({
                "bounds": [0, 0, 1080, 2400],
                "package": "com.android.dialer",
                "children": [
                    {"bounds": [10, 20, 200, 80], "text": "Call", "resource-id": "id/call"},
                    {"bounds": [10, 100, 200, 160], "text": "Contacts"}
                ]
            })),
            foreground: ForegroundApp {
                package: Some("com.android.dialer".to_string()),
                activity: Some(".MainActivity".to_string()),
            },
            geometry: ScreenGeometry {
                screenshot_size_px: None,
                logical_screen_size_px: None,
                physical_frame_boundary_px: None,
                orientation: None,
            },
            notifications,
            device_epoch_time_ms: Some(1_722_500_000_000),
        }
    }

    #[test]
    fn ui_elements_sorted_regardless_of_tree_order() {
        let tree_a = json!({"children": [
            {"bounds": [10, 10, 20, 20], "text": "b"},
            {"bounds": [0, 0, 5, 5], "text": "a"}
        ]});
        let tree_b = json!({"children": [
            {"bounds": [0, 0, 5, 5], "text": "a"},
            {"bounds": [10, 10, 20, 20], "text": "b"}
        ]});
        assert_eq!(
            canonical_ui_elements(&tree_a, None),
            canonical_ui_elements(&tree_b, None)
        );
    }

    #[test]
    fn uiautomator_bounds_strings_parse() {
        let tree = json!({"bounds": "[0,0][1080,2400]"});
        let elements = canonical_ui_elements(&tree, Some("com.example"));
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].bbox, [0, 0, 1080, 2400]);
        assert_eq!(elements[0].package.as_deref(), Some("com.example"));
    }

    #[test]
    fn notification_jitter_does_not_change_obs_digest_by_default() {
        let quiet = observation(vec![]);
        let noisy = observation(vec![json!({
            "package": "com.android.systemui",
            "when_ms": 1_722_500_012_345u64,
            "text": "Charging"
        })]);
        let (_, a) = compute_obs_digests(&quiet, false).expect("a");
        let (_, b) = compute_obs_digests(&noisy, false).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn volatile_opt_in_changes_obs_digest() {
        let quiet = observation(vec![]);
        let noisy = observation(vec![json!({
            "package": "com.android.systemui",
            "when_ms": 1_722_500_012_345u64,
            "text": "Charging"
        })]);
        let (_, a) = compute_obs_digests(&quiet, true).expect("a");
        let (_, b) = compute_obs_digests(&noisy, true).expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn notification_timestamps_bucket_away_small_jitter() {
        let early = canonical_notifications(&[json!({
            "package": "com.app", "when_ms": 1_722_500_000_100u64, "text": "hi"
        })]);
        let late = canonical_notifications(&[json!({
            "package": "com.app", "when_ms": 1_722_500_000_900u64, "text": "hi"
        })]);
        assert_eq!(early, late);
    }

    #[test]
    fn obs_digest_recomputes_from_recorded_components() {
        let obs = observation(vec![]);
        let (components, digest) = compute_obs_digests(&obs, false).expect("digests");
        assert_eq!(digest.expect("digest"), combine_components(&components));
    }
}
