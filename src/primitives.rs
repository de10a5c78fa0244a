//! Built-in behaviors behind the IR statements and sensing expressions.
//!
//! Every function works on the world directly and never suspends. Timed
//! behaviors (glide, timed speech, sound until done) hand the duration back to
//! the interpreter, which owns all waiting.

use crate::bridge::{EntityPatch, HostEvent};
use crate::error::PrimitiveError;
use crate::ir::{Query, SpeechKind, EDGE_TARGET, MOUSE_TARGET};
use crate::stage::{
    boxes_overlap, canvas_to_stage, clamp_stage, contains_point, distance, heading, rad_to_deg,
    stage_to_canvas, touches_edge, wrap_direction, CanvasPoint, StagePoint, HALF_STAGE_HEIGHT,
    HALF_STAGE_WIDTH,
};
use crate::value::Value;
use crate::world::{Costume, EntityId, RuntimeWorld};

type Result<T = ()> = std::result::Result<T, PrimitiveError>;

/// Distance reported for targets that do not exist.
pub const UNKNOWN_DISTANCE: f64 = 10000.0;

/// Strict numeric argument: non-numeric text is an error, not zero.
pub fn number_arg(value: &Value, argument: &'static str) -> Result<f64> {
    value.try_number().ok_or_else(|| PrimitiveError::InvalidNumber {
        argument,
        value: value.as_text(),
    })
}

fn finite(value: f64, what: &'static str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PrimitiveError::NonFinite { what })
    }
}

fn position_patch(x: f64, y: f64) -> EntityPatch {
    let canvas = stage_to_canvas(StagePoint { x, y });
    EntityPatch {
        x: Some(x),
        y: Some(y),
        canvas_x: Some(canvas.x),
        canvas_y: Some(canvas.y),
        ..EntityPatch::default()
    }
}

// ---- motion ----

pub fn move_to(world: &mut RuntimeWorld, id: EntityId, x: f64, y: f64) -> Result {
    if x.is_nan() || y.is_nan() {
        return Err(PrimitiveError::NonFinite { what: "position" });
    }
    let entity = world.entity_mut(id)?;
    let clamped = clamp_stage(StagePoint { x, y }, entity.half_size());
    entity.x = clamped.x;
    entity.y = clamped.y;
    world.notify_patch(id, position_patch(clamped.x, clamped.y));
    Ok(())
}

pub fn move_by(world: &mut RuntimeWorld, id: EntityId, dx: f64, dy: f64) -> Result {
    let entity = world.entity(id)?;
    let (x, y) = (entity.x + dx, entity.y + dy);
    move_to(world, id, x, y)
}

pub fn move_steps(world: &mut RuntimeWorld, id: EntityId, steps: f64) -> Result {
    let (sin, cos) = heading(world.entity(id)?.rotation);
    move_by(world, id, steps * sin, steps * cos)
}

pub fn rotate(world: &mut RuntimeWorld, id: EntityId, degrees: f64) -> Result {
    let degrees = finite(degrees, "rotation")?;
    let current = world.entity(id)?.rotation;
    point_in_direction(world, id, current + degrees)
}

pub fn point_in_direction(world: &mut RuntimeWorld, id: EntityId, direction: f64) -> Result {
    let direction = wrap_direction(finite(direction, "direction")?);
    world.entity_mut(id)?.rotation = direction;
    world.notify_patch(
        id,
        EntityPatch {
            rotation: Some(direction),
            ..EntityPatch::default()
        },
    );
    Ok(())
}

/// Reflects the heading off the nearest touched edge and pulls the entity
/// back inside the stage.
pub fn bounce_on_edge(world: &mut RuntimeWorld, id: EntityId) -> Result {
    let entity = world.entity_mut(id)?;
    let half = entity.half_size();
    let left = entity.x - half.w + HALF_STAGE_WIDTH;
    let right = HALF_STAGE_WIDTH - (entity.x + half.w);
    let top = HALF_STAGE_HEIGHT - (entity.y + half.h);
    let bottom = entity.y - half.h + HALF_STAGE_HEIGHT;
    let nearest = left.min(right).min(top).min(bottom);
    if nearest > 0.0 {
        return Ok(());
    }
    let (mut dx, mut dy) = heading(entity.rotation);
    if nearest == left {
        dx = dx.abs().max(0.2);
    } else if nearest == right {
        dx = -dx.abs().max(0.2);
    } else if nearest == top {
        dy = -dy.abs().max(0.2);
    } else {
        dy = dy.abs().max(0.2);
    }
    entity.rotation = wrap_direction(rad_to_deg(dx.atan2(dy)));
    let max_x = (HALF_STAGE_WIDTH - half.w).max(0.0);
    let max_y = (HALF_STAGE_HEIGHT - half.h).max(0.0);
    entity.x = entity.x.clamp(-max_x, max_x);
    entity.y = entity.y.clamp(-max_y, max_y);
    let mut patch = position_patch(entity.x, entity.y);
    patch.rotation = Some(entity.rotation);
    world.notify_patch(id, patch);
    Ok(())
}

/// Endpoints of a glide in canvas space. The target is clamped up front.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlidePlan {
    pub from: CanvasPoint,
    pub to: CanvasPoint,
}

pub fn plan_glide(world: &RuntimeWorld, id: EntityId, x: f64, y: f64) -> Result<GlidePlan> {
    if x.is_nan() || y.is_nan() {
        return Err(PrimitiveError::NonFinite { what: "position" });
    }
    let entity = world.entity(id)?;
    let target = clamp_stage(StagePoint { x, y }, entity.half_size());
    Ok(GlidePlan {
        from: entity.canvas(),
        to: stage_to_canvas(target),
    })
}

/// Places the entity at fraction `t` of the glide; `t >= 1` lands exactly on
/// the target.
pub fn glide_step(world: &mut RuntimeWorld, id: EntityId, plan: GlidePlan, t: f64) -> Result {
    let t = t.clamp(0.0, 1.0);
    let canvas = CanvasPoint {
        x: plan.from.x + (plan.to.x - plan.from.x) * t,
        y: plan.from.y + (plan.to.y - plan.from.y) * t,
    };
    let p = if t >= 1.0 {
        canvas_to_stage(plan.to)
    } else {
        canvas_to_stage(canvas)
    };
    let entity = world.entity_mut(id)?;
    entity.x = p.x;
    entity.y = p.y;
    world.notify_patch(id, position_patch(p.x, p.y));
    Ok(())
}

// ---- looks ----

pub fn set_size(world: &mut RuntimeWorld, id: EntityId, percent: f64) -> Result {
    let percent = finite(percent, "size")?.max(0.0);
    let scale = percent / 100.0;
    world.entity_mut(id)?.scale = scale;
    world.notify_patch(
        id,
        EntityPatch {
            scale: Some(scale),
            ..EntityPatch::default()
        },
    );
    Ok(())
}

pub fn change_size(world: &mut RuntimeWorld, id: EntityId, percent: f64) -> Result {
    let current = world.entity(id)?.scale * 100.0;
    set_size(world, id, current + percent)
}

pub fn set_visible(world: &mut RuntimeWorld, id: EntityId, visible: bool) -> Result {
    world.entity_mut(id)?.visible = visible;
    world.notify_patch(
        id,
        EntityPatch {
            visible: Some(visible),
            ..EntityPatch::default()
        },
    );
    Ok(())
}

/// Shows a bubble and returns its sequence number for `clear_speech`.
pub fn say(
    world: &mut RuntimeWorld,
    id: EntityId,
    kind: SpeechKind,
    text: String,
    secs: Option<f64>,
) -> Result<u64> {
    let entity = world.entity_mut(id)?;
    entity.speech_seq += 1;
    let seq = entity.speech_seq;
    world.notify(HostEvent::SpeechBubble {
        entity: id,
        text,
        kind,
        duration_ms: secs.map(|s| (s.max(0.0) * 1000.0).round() as u64),
    });
    Ok(seq)
}

/// Removes the bubble shown as `seq` unless something newer replaced it.
pub fn clear_speech(world: &mut RuntimeWorld, id: EntityId, kind: SpeechKind, seq: u64) -> Result {
    let entity = world.entity_mut(id)?;
    if entity.speech_seq != seq {
        return Ok(());
    }
    entity.speech_seq += 1;
    world.notify(HostEvent::SpeechBubble {
        entity: id,
        text: String::new(),
        kind,
        duration_ms: None,
    });
    Ok(())
}

/// Maps a 1-based list position onto `0..len`, wrapping in both directions.
/// Stays in f64 so that huge finite positions cannot overflow.
fn wrap_index(position: f64, len: usize) -> usize {
    let wrapped = (position.round() - 1.0).rem_euclid(len as f64) as usize;
    wrapped.min(len - 1)
}

fn costume_index(
    costumes: &[Costume],
    current: usize,
    value: &Value,
    keywords: (&str, &str),
) -> Option<usize> {
    let len = costumes.len();
    if len == 0 {
        return None;
    }
    let by_number = |n: f64| Some(wrap_index(n, len));
    match value {
        Value::Number(n) if n.is_finite() => by_number(*n),
        Value::Number(_) | Value::Bool(_) => None,
        Value::Text(name) => {
            if let Some(i) = costumes.iter().position(|c| c.name == *name) {
                return Some(i);
            }
            let lowered = name.trim().to_lowercase();
            if lowered == keywords.0 {
                Some((current + 1) % len)
            } else if lowered == keywords.1 {
                Some((current + len - 1) % len)
            } else {
                crate::value::parse_number(name)
                    .filter(|n| n.is_finite())
                    .and_then(by_number)
            }
        }
    }
}

fn apply_costume(world: &mut RuntimeWorld, id: EntityId, index: usize) -> Result {
    let entity = world.entity_mut(id)?;
    entity.current_costume = index;
    let is_background = entity.is_background();
    let name = entity.costume().map(|c| c.name.clone()).unwrap_or_default();
    world.notify_patch(
        id,
        EntityPatch {
            costume: Some(index),
            ..EntityPatch::default()
        },
    );
    if is_background {
        world.notify(HostEvent::SwitchBackground {
            background: id,
            costume: name,
        });
    }
    Ok(())
}

pub fn switch_costume(world: &mut RuntimeWorld, id: EntityId, costume: &Value) -> Result {
    let entity = world.entity(id)?;
    if entity.is_background() {
        return switch_background(world, costume);
    }
    let index = costume_index(
        &entity.costumes,
        entity.current_costume,
        costume,
        ("next costume", "previous costume"),
    )
    .ok_or_else(|| PrimitiveError::UnknownCostume(costume.as_text()))?;
    apply_costume(world, id, index)
}

pub fn next_costume(world: &mut RuntimeWorld, id: EntityId) -> Result {
    let entity = world.entity(id)?;
    if entity.costumes.is_empty() {
        return Ok(());
    }
    let index = (entity.current_costume + 1) % entity.costumes.len();
    apply_costume(world, id, index)
}

pub fn switch_background(world: &mut RuntimeWorld, backdrop: &Value) -> Result {
    let id = world.background().ok_or(PrimitiveError::NoBackground)?;
    let entity = world.entity(id)?;
    let len = entity.costumes.len();
    let current = entity.current_costume;
    let index = if backdrop.as_text().trim().eq_ignore_ascii_case("random backdrop") && len > 0 {
        if len == 1 {
            0
        } else {
            let offset = world.rng.int_range(1, len as i64 - 1) as usize;
            (current + offset) % len
        }
    } else {
        costume_index(
            &entity.costumes,
            current,
            backdrop,
            ("next backdrop", "previous backdrop"),
        )
        .ok_or_else(|| PrimitiveError::UnknownBackdrop(backdrop.as_text()))?
    };
    apply_costume(world, id, index)
}

pub fn next_background(world: &mut RuntimeWorld) -> Result {
    let id = world.background().ok_or(PrimitiveError::NoBackground)?;
    next_costume(world, id)
}

// ---- sound ----

/// Announces the sound and returns its duration in seconds.
pub fn start_sound(world: &mut RuntimeWorld, id: EntityId, sound: &Value) -> Result<f64> {
    let entity = world.entity(id)?;
    let name = sound.as_text();
    let found = entity
        .sounds
        .iter()
        .find(|s| s.name == name)
        .or_else(|| {
            entity
                .sounds
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(&name))
        })
        .or_else(|| {
            let n = sound.try_number().filter(|n| n.is_finite())?;
            let len = entity.sounds.len();
            if len == 0 {
                return None;
            }
            entity.sounds.get(wrap_index(n, len))
        })
        .ok_or(PrimitiveError::UnknownSound(name))?;
    let (sound_name, duration) = (found.name.clone(), found.duration_secs);
    world.notify(HostEvent::SoundStarted {
        entity: id,
        sound: sound_name,
    });
    Ok(duration)
}

pub fn stop_all_sounds(world: &mut RuntimeWorld) {
    world.notify(HostEvent::SoundsStopped);
}

// ---- data ----

pub fn set_var(world: &mut RuntimeWorld, id: EntityId, name: &str, value: Value) {
    let var = world.variable_mut(id, name);
    var.value = value;
    let event = HostEvent::VariableVisibilityChanged {
        name: name.to_string(),
        visible: var.visible,
        value: var.value.clone(),
    };
    world.notify(event);
}

pub fn change_var(world: &mut RuntimeWorld, id: EntityId, name: &str, delta: f64) {
    let current = world
        .variable(id, name)
        .map(|v| v.value.to_number())
        .unwrap_or(0.0);
    set_var(world, id, name, Value::Number(current + delta));
}

pub fn set_variable_visible(world: &mut RuntimeWorld, id: EntityId, name: &str, visible: bool) {
    let var = world.variable_mut(id, name);
    var.visible = visible;
    let event = HostEvent::VariableVisibilityChanged {
        name: name.to_string(),
        visible,
        value: var.value.clone(),
    };
    world.notify(event);
}

pub fn variable_value(world: &RuntimeWorld, id: EntityId, name: &str) -> Value {
    world
        .variable(id, name)
        .map(|v| v.value.clone())
        .unwrap_or_default()
}

// ---- sensing ----

pub fn reset_timer(world: &mut RuntimeWorld) {
    world.globals.timer_start = tokio::time::Instant::now();
}

pub fn query(world: &RuntimeWorld, id: EntityId, query: Query) -> Result<Value> {
    let entity = world.entity(id)?;
    let backdrop = || {
        world
            .background()
            .and_then(|b| world.entities.get(b.0))
            .map(|b| {
                (
                    b.current_costume + 1,
                    b.costume().map(|c| c.name.clone()).unwrap_or_default(),
                )
            })
            .unwrap_or((1, String::new()))
    };
    let value = match query {
        Query::XPosition => Value::Number(entity.x),
        Query::YPosition => Value::Number(entity.y),
        Query::Direction => Value::Number(entity.rotation),
        Query::Size => Value::Number((entity.scale * 100.0).round()),
        Query::CostumeNumber => Value::Number((entity.current_costume + 1) as f64),
        Query::CostumeName => {
            Value::Text(entity.costume().map(|c| c.name.clone()).unwrap_or_default())
        }
        Query::BackdropNumber => Value::Number(backdrop().0 as f64),
        Query::BackdropName => Value::Text(backdrop().1),
        Query::Timer => Value::Number(world.timer_secs()),
        Query::MouseX => Value::Number(world.globals.mouse.x),
        Query::MouseY => Value::Number(world.globals.mouse.y),
    };
    Ok(value)
}

pub fn key_pressed(world: &RuntimeWorld, key: &str) -> bool {
    let key = crate::bus::normalize_key(key);
    if key == crate::bus::ANY_KEY {
        return !world.globals.pressed_keys.is_empty();
    }
    world.globals.pressed_keys.contains(&key)
}

/// Axis-aligned collision. Hidden entities never touch anything.
pub fn touching(world: &RuntimeWorld, id: EntityId, target: &str) -> Result<bool> {
    let me = world.entity(id)?;
    if !me.visible {
        return Ok(false);
    }
    let (center, half) = (me.position(), me.half_size());
    let hit = match target {
        EDGE_TARGET => touches_edge(center, half),
        MOUSE_TARGET => contains_point(center, half, world.globals.mouse),
        name => match world.find_entity(name).and_then(|o| world.entities.get(o.0)) {
            Some(other) if other.id != id && other.visible && !other.is_background() => {
                boxes_overlap(center, half, other.position(), other.half_size())
            }
            _ => false,
        },
    };
    Ok(hit)
}

pub fn distance_to(world: &RuntimeWorld, id: EntityId, target: &str) -> Result<f64> {
    let me = world.entity(id)?.position();
    let other = match target {
        MOUSE_TARGET => Some(world.globals.mouse),
        name => world
            .find_entity(name)
            .and_then(|o| world.entities.get(o.0))
            .filter(|o| !o.is_background())
            .map(|o| o.position()),
    };
    Ok(other.map(|p| distance(me, p)).unwrap_or(UNKNOWN_DISTANCE))
}

/// Integer pick when both bounds are integers, uniform float otherwise.
pub fn pick_random(world: &mut RuntimeWorld, from: &Value, to: &Value) -> f64 {
    let (a, b) = (from.to_number(), to.to_number());
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let looks_integral = |v: &Value, n: f64| {
        n.fract() == 0.0 && !matches!(v, Value::Text(s) if s.contains('.'))
    };
    if looks_integral(from, a) && looks_integral(to, b) && high - low < 9.0e15 {
        world.rng.int_range(low as i64, high as i64) as f64
    } else {
        low + world.rng.next_f64() * (high - low)
    }
}
