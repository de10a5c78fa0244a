//! Stage geometry shared by every position-related primitive.
//!
//! Stage coordinates are centred (x right, y up) over a 480x360 stage;
//! canvas coordinates start at the top-left corner with y growing down.

use serde::{Deserialize, Serialize};

pub const STAGE_WIDTH: f64 = 480.0;
pub const STAGE_HEIGHT: f64 = 360.0;
pub const HALF_STAGE_WIDTH: f64 = STAGE_WIDTH / 2.0;
pub const HALF_STAGE_HEIGHT: f64 = STAGE_HEIGHT / 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasPoint {
    pub x: f64,
    pub y: f64,
}

pub fn stage_to_canvas(p: StagePoint) -> CanvasPoint {
    CanvasPoint {
        x: p.x + HALF_STAGE_WIDTH,
        y: HALF_STAGE_HEIGHT - p.y,
    }
}

pub fn canvas_to_stage(p: CanvasPoint) -> StagePoint {
    StagePoint {
        x: p.x - HALF_STAGE_WIDTH,
        y: HALF_STAGE_HEIGHT - p.y,
    }
}

/// Half extents of an entity's bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfSize {
    pub w: f64,
    pub h: f64,
}

/// Clamps a canvas position so that the entity may leave the stage entirely
/// but no further: `[-half, extent + half]` on each axis.
pub fn clamp_canvas(p: CanvasPoint, half: HalfSize) -> CanvasPoint {
    CanvasPoint {
        x: p.x.clamp(-half.w, STAGE_WIDTH + half.w),
        y: p.y.clamp(-half.h, STAGE_HEIGHT + half.h),
    }
}

pub fn clamp_stage(p: StagePoint, half: HalfSize) -> StagePoint {
    canvas_to_stage(clamp_canvas(stage_to_canvas(p), half))
}

pub fn touches_edge(center: StagePoint, half: HalfSize) -> bool {
    center.x - half.w <= -HALF_STAGE_WIDTH
        || center.x + half.w >= HALF_STAGE_WIDTH
        || center.y - half.h <= -HALF_STAGE_HEIGHT
        || center.y + half.h >= HALF_STAGE_HEIGHT
}

pub fn boxes_overlap(a: StagePoint, a_half: HalfSize, b: StagePoint, b_half: HalfSize) -> bool {
    (a.x - b.x).abs() < a_half.w + b_half.w && (a.y - b.y).abs() < a_half.h + b_half.h
}

pub fn contains_point(center: StagePoint, half: HalfSize, p: StagePoint) -> bool {
    (p.x - center.x).abs() <= half.w && (p.y - center.y).abs() <= half.h
}

pub fn distance(a: StagePoint, b: StagePoint) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

pub fn deg_to_rad(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

pub fn rad_to_deg(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

/// Rounds trig results to 10 decimals so that `sin(180)` is exactly 0.
fn snap(v: f64) -> f64 {
    (v * 1e10).round() / 1e10
}

pub fn sin_deg(deg: f64) -> f64 {
    snap(deg_to_rad(deg).sin())
}

pub fn cos_deg(deg: f64) -> f64 {
    snap(deg_to_rad(deg).cos())
}

pub fn tan_deg(deg: f64) -> f64 {
    match deg.rem_euclid(360.0) {
        d if d == 90.0 => f64::INFINITY,
        d if d == 270.0 => f64::NEG_INFINITY,
        _ => snap(deg_to_rad(deg).tan()),
    }
}

/// Normalizes a direction into `(-180, 180]`, 90 pointing right.
pub fn wrap_direction(deg: f64) -> f64 {
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

/// Unit step for a direction: 0 is up, 90 is right.
pub fn heading(direction: f64) -> (f64, f64) {
    (sin_deg(direction), cos_deg(direction))
}
