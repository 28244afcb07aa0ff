// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Action normalization: canonicalize coordinates to `physical_px` before
//! execution. An action already in physical pixels passes through untouched
//! (no scale, no offset, no `coord_transform`); any other input space gets
//! an explicit recorded mapping.

use masbench_core::device::{
    ActionKind, CoordSpace, CoordTransform, NormalizedAction, RawAction, ScreenGeometry,
};

pub const WARN_COORD_SPACE_UNSPECIFIED: &str = "coord_space_unspecified";
pub const WARN_COORD_UNRESOLVED: &str = "coord_unresolved";
pub const WARN_REF_MISMATCH: &str = "ref_mismatch";

fn has_coordinates(kind: &ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::Tap { .. } | ActionKind::LongPress { .. } | ActionKind::Swipe { .. }
    )
}

fn physical_size(geometry: &ScreenGeometry) -> Option<(f64, f64)> {
    if let Some(frame) = geometry.physical_frame_boundary_px {
        let w = (frame.right - frame.left) as f64;
        let h = (frame.bottom - frame.top) as f64;
        if w > 0.0 && h > 0.0 {
            return Some((w, h));
        }
    }
    geometry
        .screenshot_size_px
        .map(|s| (f64::from(s.w), f64::from(s.h)))
}

fn logical_size(geometry: &ScreenGeometry) -> Option<(f64, f64)> {
    geometry
        .logical_screen_size_px
        .map(|s| (f64::from(s.w), f64::from(s.h)))
}

fn apply(kind: &ActionKind, transform: &CoordTransform) -> ActionKind {
    let map_x = |x: f64| x * transform.scale_x + transform.offset_x;
    let map_y = |y: f64| y * transform.scale_y + transform.offset_y;
    match kind {
        ActionKind::Tap { x, y } => ActionKind::Tap {
            x: map_x(*x),
            y: map_y(*y),
        },
        ActionKind::LongPress { x, y } => ActionKind::LongPress {
            x: map_x(*x),
            y: map_y(*y),
        },
        ActionKind::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms,
        } => ActionKind::Swipe {
            x1: map_x(*x1),
            y1: map_y(*y1),
            x2: map_x(*x2),
            y2: map_y(*y2),
            duration_ms: *duration_ms,
        },
        other => other.clone(),
    }
}

/// Normalize one raw agent action against the current screen geometry.
/// Returns the normalized action plus normalization warnings.
pub fn normalize_action(
    raw: &RawAction,
    geometry: &ScreenGeometry,
) -> (NormalizedAction, Vec<String>) {
    let mut warnings = Vec::new();

    if !has_coordinates(&raw.kind) {
        return (
            NormalizedAction {
                kind: raw.kind.clone(),
                coord_space: CoordSpace::PhysicalPx,
                ref_obs_digest: raw.ref_obs_digest.clone(),
                coord_transform: None,
            },
            warnings,
        );
    }

    let declared = raw.coord_space.unwrap_or_else(|| {
        warnings.push(WARN_COORD_SPACE_UNSPECIFIED.to_string());
        CoordSpace::PhysicalPx
    });

    let transform = match declared {
        CoordSpace::PhysicalPx => None,
        CoordSpace::LogicalPx => match (logical_size(geometry), physical_size(geometry)) {
            (Some((lw, lh)), Some((pw, ph))) if lw > 0.0 && lh > 0.0 => Some(CoordTransform {
                from_space: CoordSpace::LogicalPx,
                scale_x: pw / lw,
                scale_y: ph / lh,
                offset_x: 0.0,
                offset_y: 0.0,
            }),
            _ => {
                warnings.push(WARN_COORD_UNRESOLVED.to_string());
                None
            }
        },
        CoordSpace::Normalized01 => match physical_size(geometry) {
            Some((pw, ph)) => Some(CoordTransform {
                from_space: CoordSpace::Normalized01,
                scale_x: pw,
                scale_y: ph,
                offset_x: 0.0,
                offset_y: 0.0,
            }),
            None => {
                warnings.push(WARN_COORD_UNRESOLVED.to_string());
                None
            }
        },
    };

    let kind = match &transform {
        Some(t) => apply(&raw.kind, t),
        None => raw.kind.clone(),
    };

    (
        NormalizedAction {
            kind,
            coord_space: CoordSpace::PhysicalPx,
            ref_obs_digest: raw.ref_obs_digest.clone(),
            coord_transform: transform,
        },
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use masbench_core::device::{FrameBoundaryPx, SizePx};

    fn geometry() -> ScreenGeometry {
        ScreenGeometry {
            screenshot_size_px: Some(SizePx { w: 1080, h: 2400 }),
            logical_screen_size_px: Some(SizePx { w: 540, h: 1200 }),
            physical_frame_boundary_px: Some(FrameBoundaryPx {
                left: 0,
                top: 0,
                right: 1080,
                bottom: 2400,
            }),
            orientation: None,
        }
    }

    #[test]
    fn physical_input_is_identity_with_no_transform() {
        let raw = RawAction {
            kind: ActionKind::Tap { x: 120.0, y: 300.0 },
            coord_space: Some(CoordSpace::PhysicalPx),
            ref_obs_digest: None,
        };
        let (normalized, warnings) = normalize_action(&raw, &geometry());
        assert!(warnings.is_empty());
        assert!(normalized.coord_transform.is_none());
        assert_eq!(normalized.kind, ActionKind::Tap { x: 120.0, y: 300.0 });
        assert_eq!(normalized.coord_space, CoordSpace::PhysicalPx);
    }

    #[test]
    fn logical_input_is_scaled_and_transform_recorded() {
        let raw = RawAction {
            kind: ActionKind::Tap { x: 100.0, y: 200.0 },
            coord_space: Some(CoordSpace::LogicalPx),
            ref_obs_digest: None,
        };
        let (normalized, warnings) = normalize_action(&raw, &geometry());
        assert!(warnings.is_empty());
        assert_eq!(normalized.kind, ActionKind::Tap { x: 200.0, y: 400.0 });
        let transform = normalized.coord_transform.expect("transform");
        assert_eq!(transform.from_space, CoordSpace::LogicalPx);
    }

    #[test]
    fn normalized01_scales_to_physical_frame() {
        let raw = RawAction {
            kind: ActionKind::Tap { x: 0.5, y: 0.25 },
            coord_space: Some(CoordSpace::Normalized01),
            ref_obs_digest: None,
        };
        let (normalized, _) = normalize_action(&raw, &geometry());
        assert_eq!(normalized.kind, ActionKind::Tap { x: 540.0, y: 600.0 });
    }

    #[test]
    fn missing_geometry_warns_unresolved() {
        let raw = RawAction {
            kind: ActionKind::Tap { x: 0.5, y: 0.5 },
            coord_space: Some(CoordSpace::Normalized01),
            ref_obs_digest: None,
        };
        let empty = ScreenGeometry {
            screenshot_size_px: None,
            logical_screen_size_px: None,
            physical_frame_boundary_px: None,
            orientation: None,
        };
        let (_, warnings) = normalize_action(&raw, &empty);
        assert_eq!(warnings, vec![WARN_COORD_UNRESOLVED.to_string()]);
    }

    #[test]
    fn non_coordinate_actions_pass_through() {
        let raw = RawAction {
            kind: ActionKind::TypeText {
                text: "hello".to_string(),
            },
            coord_space: None,
            ref_obs_digest: Some("d".repeat(64)),
        };
        let (normalized, warnings) = normalize_action(&raw, &geometry());
        assert!(warnings.is_empty());
        assert_eq!(normalized.ref_obs_digest.as_deref(), Some("d".repeat(64).as_str()));
    }
}
