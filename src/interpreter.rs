//! Executes compiled scripts inside a scheduler task.
//!
//! Statements run synchronously against the world until they hit a
//! suspension point. The world is only borrowed inside `with_world`
//! closures, never across an `.await`, and every suspension checks the task's
//! cancellation token first.

use crate::bridge::HostEvent;
use crate::error::{Interrupt, PrimitiveError, StepResult};
use crate::ir::{ArithOp, CompareOp, Expr, MathFunc, Script, SpeechKind, Stmt, StopScope};
use crate::primitives::{self, number_arg, GlidePlan};
use crate::scheduler::{Shared, TaskId, TaskState};
use crate::stage::{cos_deg, rad_to_deg, sin_deg, tan_deg};
use crate::value::Value;
use crate::world::{EntityId, RuntimeWorld};
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub struct TaskContext {
    shared: Rc<Shared>,
    pub entity: EntityId,
    pub task: TaskId,
    token: CancellationToken,
    steps: Cell<u64>,
    step_warning: u64,
}

impl TaskContext {
    pub(crate) fn new(
        shared: Rc<Shared>,
        entity: EntityId,
        task: TaskId,
        token: CancellationToken,
        step_warning: u64,
    ) -> Self {
        Self {
            shared,
            entity,
            task,
            token,
            steps: Cell::new(0),
            step_warning,
        }
    }

    pub(crate) async fn run(self, script: Rc<Script>) {
        let outcome = if self.token.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            self.set_state(TaskState::Running);
            self.exec_block(&script.body).await
        };
        self.shared.finish_task(self.task, self.entity, outcome);
    }

    fn set_state(&self, state: TaskState) {
        self.shared.set_task_state(self.task, state);
    }

    fn with_world<R>(&self, f: impl FnOnce(&mut RuntimeWorld) -> R) -> R {
        f(&mut self.shared.world.borrow_mut())
    }

    fn check(&self) -> StepResult {
        if self.token.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn yield_now(&self) -> StepResult {
        self.check()?;
        self.set_state(TaskState::Suspended);
        tokio::task::yield_now().await;
        self.set_state(TaskState::Running);
        self.check()
    }

    /// Sleeps unless cancelled first. A zero duration still yields once.
    async fn sleep(&self, duration: Duration) -> StepResult {
        if duration.is_zero() {
            return self.yield_now().await;
        }
        self.set_state(TaskState::Suspended);
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        };
        self.set_state(TaskState::Running);
        result
    }

    /// Asks the host for the mouse position. Without an answer in time the
    /// last known position stays in effect.
    async fn sync_mouse(&self) -> StepResult {
        let (tx, rx) = oneshot::channel();
        let timeout = self.with_world(|w| {
            w.add_mouse_waiter(tx);
            w.notify(HostEvent::MousePositionRequest {
                entity: self.entity,
            });
            w.options.mouse_timeout
        });
        self.set_state(TaskState::Suspended);
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            reply = tokio::time::timeout(timeout, rx) => {
                if !matches!(reply, Ok(Ok(_))) {
                    tracing::trace!(entity = %self.entity, "mouse position request unanswered");
                }
                Ok(())
            }
        };
        self.set_state(TaskState::Running);
        result
    }

    fn count_step(&self) {
        let steps = self.steps.get() + 1;
        self.steps.set(steps);
        if steps == self.step_warning {
            tracing::warn!(
                task = self.task,
                entity = %self.entity,
                steps,
                "script is running a very large number of statements"
            );
        }
    }

    fn exec_block<'a>(&'a self, body: &'a [Stmt]) -> LocalBoxFuture<'a, StepResult> {
        Box::pin(async move {
            for stmt in body {
                self.exec(stmt).await?;
            }
            Ok(())
        })
    }

    async fn exec(&self, stmt: &Stmt) -> StepResult {
        self.count_step();
        let e = self.entity;
        match stmt {
            Stmt::MoveTo { x, y } => self.with_world(|w| {
                let x = number(w, e, x, "X")?;
                let y = number(w, e, y, "Y")?;
                primitives::move_to(w, e, x, y)
            })?,
            Stmt::MoveBy { dx, dy } => self.with_world(|w| {
                let dx = number(w, e, dx, "DX")?;
                let dy = number(w, e, dy, "DY")?;
                primitives::move_by(w, e, dx, dy)
            })?,
            Stmt::MoveSteps { steps } => self.with_world(|w| {
                let steps = number(w, e, steps, "STEPS")?;
                primitives::move_steps(w, e, steps)
            })?,
            Stmt::Glide { secs, x, y } => {
                let (secs, plan) = self.with_world(|w| -> Result<_, PrimitiveError> {
                    let secs = number(w, e, secs, "SECS")?;
                    let x = number(w, e, x, "X")?;
                    let y = number(w, e, y, "Y")?;
                    Ok((secs, primitives::plan_glide(w, e, x, y)?))
                })?;
                self.glide(secs, plan).await?;
            }
            Stmt::Rotate { degrees } => self.with_world(|w| {
                let degrees = number(w, e, degrees, "DEGREES")?;
                primitives::rotate(w, e, degrees)
            })?,
            Stmt::PointInDirection { direction } => self.with_world(|w| {
                let direction = number(w, e, direction, "DIRECTION")?;
                primitives::point_in_direction(w, e, direction)
            })?,
            Stmt::BounceOnEdge => self.with_world(|w| primitives::bounce_on_edge(w, e))?,
            Stmt::SetSize { percent } => self.with_world(|w| {
                let percent = number(w, e, percent, "SIZE")?;
                primitives::set_size(w, e, percent)
            })?,
            Stmt::ChangeSize { percent } => self.with_world(|w| {
                let percent = number(w, e, percent, "CHANGE")?;
                primitives::change_size(w, e, percent)
            })?,
            Stmt::Show => self.with_world(|w| primitives::set_visible(w, e, true))?,
            Stmt::Hide => self.with_world(|w| primitives::set_visible(w, e, false))?,
            Stmt::Wait { secs } => {
                let secs = self.with_world(|w| number(w, e, secs, "DURATION"))?;
                self.sleep(seconds(secs)).await?;
            }
            Stmt::WaitUntil {
                condition,
                sync_mouse,
            } => loop {
                if *sync_mouse {
                    self.sync_mouse().await?;
                }
                if self.with_world(|w| evaluate(w, e, condition))?.to_bool() {
                    break;
                }
                let poll = self.with_world(|w| w.options.poll_interval);
                self.sleep(poll).await?;
            },
            Stmt::RepeatN { times, body } => {
                let times = self.with_world(|w| number(w, e, times, "TIMES"))?;
                let count = if times > 0.0 { times.round() as u64 } else { 0 };
                for _ in 0..count {
                    self.exec_loop_body(body).await?;
                }
            }
            Stmt::RepeatUntil { condition, body } => loop {
                if self.with_world(|w| evaluate(w, e, condition))?.to_bool() {
                    break;
                }
                self.exec_loop_body(body).await?;
            },
            Stmt::Forever { body } => loop {
                self.exec_loop_body(body).await?;
            },
            Stmt::If {
                condition,
                then_body,
                else_body,
            } => {
                let taken = if self.with_world(|w| evaluate(w, e, condition))?.to_bool() {
                    then_body
                } else {
                    else_body
                };
                self.exec_block(taken).await?;
            }
            Stmt::Broadcast { message } => {
                let name = self.with_world(|w| evaluate(w, e, message))?.as_text();
                self.shared.broadcast(&name, e);
            }
            Stmt::BroadcastAndWait { message, secs } => {
                let (name, secs) = self.with_world(|w| -> Result<_, PrimitiveError> {
                    Ok((evaluate(w, e, message)?.as_text(), number(w, e, secs, "SECS")?))
                })?;
                self.shared.broadcast(&name, e);
                self.sleep(seconds(secs)).await?;
            }
            Stmt::SetVar { name, value } => self.with_world(|w| {
                let value = evaluate(w, e, value)?;
                primitives::set_var(w, e, name, value);
                Ok::<_, PrimitiveError>(())
            })?,
            Stmt::ChangeVar { name, delta } => self.with_world(|w| {
                let delta = number(w, e, delta, "VALUE")?;
                primitives::change_var(w, e, name, delta);
                Ok::<_, PrimitiveError>(())
            })?,
            Stmt::ShowVariable { name } => {
                self.with_world(|w| primitives::set_variable_visible(w, e, name, true))
            }
            Stmt::HideVariable { name } => {
                self.with_world(|w| primitives::set_variable_visible(w, e, name, false))
            }
            Stmt::Speech { kind, text, secs } => self.speech(*kind, text, secs.as_ref()).await?,
            Stmt::SwitchCostume { costume } => self.with_world(|w| {
                let costume = evaluate(w, e, costume)?;
                primitives::switch_costume(w, e, &costume)
            })?,
            Stmt::NextCostume => self.with_world(|w| primitives::next_costume(w, e))?,
            Stmt::SwitchBackground { backdrop } => self.with_world(|w| {
                let backdrop = evaluate(w, e, backdrop)?;
                primitives::switch_background(w, &backdrop)
            })?,
            Stmt::NextBackground => self.with_world(primitives::next_background)?,
            Stmt::PlaySound { sound, until_done } => {
                let duration = self.with_world(|w| {
                    let sound = evaluate(w, e, sound)?;
                    primitives::start_sound(w, e, &sound)
                })?;
                if *until_done {
                    self.sleep(seconds(duration)).await?;
                }
            }
            Stmt::StopAllSounds => self.with_world(primitives::stop_all_sounds),
            Stmt::ResetTimer => self.with_world(primitives::reset_timer),
            Stmt::Stop { scope } => return self.stop(*scope),
            Stmt::SyncMouse => self.sync_mouse().await?,
            Stmt::Yield => self.yield_now().await?,
        }
        Ok(())
    }

    /// Every loop iteration ends in a yield point. Compiled bodies carry their
    /// own trailing `Yield`; hand-built ones get one here.
    async fn exec_loop_body(&self, body: &[Stmt]) -> StepResult {
        self.exec_block(body).await?;
        if matches!(body.last(), Some(Stmt::Yield)) {
            Ok(())
        } else {
            self.yield_now().await
        }
    }

    async fn glide(&self, secs: f64, plan: GlidePlan) -> StepResult {
        let e = self.entity;
        if secs.is_nan() || secs <= 0.0 {
            self.with_world(|w| primitives::glide_step(w, e, plan, 1.0))?;
            return self.yield_now().await;
        }
        let tick = self.with_world(|w| w.options.tick);
        let started = Instant::now();
        loop {
            self.sleep(tick).await?;
            let t = started.elapsed().as_secs_f64() / secs;
            self.with_world(|w| primitives::glide_step(w, e, plan, t))?;
            if t >= 1.0 {
                return Ok(());
            }
        }
    }

    async fn speech(&self, kind: SpeechKind, text: &Expr, secs: Option<&Expr>) -> StepResult {
        let e = self.entity;
        let (seq, secs) = self.with_world(|w| -> Result<_, PrimitiveError> {
            let text = evaluate(w, e, text)?.as_text();
            let secs = match secs {
                Some(secs) => Some(number(w, e, secs, "SECS")?),
                None => None,
            };
            Ok((primitives::say(w, e, kind, text, secs)?, secs))
        })?;
        if let Some(secs) = secs {
            self.sleep(seconds(secs)).await?;
            self.with_world(|w| primitives::clear_speech(w, e, kind, seq))?;
        }
        Ok(())
    }

    fn stop(&self, scope: StopScope) -> StepResult {
        match scope {
            StopScope::ThisScript => Err(Interrupt::StopScript),
            StopScope::All => {
                self.shared.stop_all();
                Err(Interrupt::Cancelled)
            }
            StopScope::ThisSprite => {
                self.shared.stop_entity(self.entity);
                Err(Interrupt::Cancelled)
            }
            StopScope::OtherScriptsInSprite => {
                self.shared.stop_other_scripts(self.entity, self.task);
                Ok(())
            }
        }
    }
}

fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

fn number(
    world: &mut RuntimeWorld,
    entity: EntityId,
    expr: &Expr,
    argument: &'static str,
) -> Result<f64, PrimitiveError> {
    number_arg(&evaluate(world, entity, expr)?, argument)
}

/// Evaluates an expression to a value. Never suspends.
pub fn evaluate(
    world: &mut RuntimeWorld,
    entity: EntityId,
    expr: &Expr,
) -> Result<Value, PrimitiveError> {
    let value = match expr {
        Expr::Literal { value } => value.clone(),
        Expr::Var { name } => primitives::variable_value(world, entity, name),
        Expr::Arith { op, left, right } => {
            let a = evaluate(world, entity, left)?.to_number();
            let b = evaluate(world, entity, right)?.to_number();
            Value::Number(arith(*op, a, b))
        }
        Expr::Compare { op, left, right } => {
            let a = evaluate(world, entity, left)?;
            let b = evaluate(world, entity, right)?;
            Value::Bool(match op {
                CompareOp::Lt => a.compare(&b).is_lt(),
                CompareOp::Gt => a.compare(&b).is_gt(),
                CompareOp::Eq => a.loosely_equals(&b),
            })
        }
        Expr::And { left, right } => Value::Bool(
            evaluate(world, entity, left)?.to_bool() && evaluate(world, entity, right)?.to_bool(),
        ),
        Expr::Or { left, right } => Value::Bool(
            evaluate(world, entity, left)?.to_bool() || evaluate(world, entity, right)?.to_bool(),
        ),
        Expr::Not { operand } => Value::Bool(!evaluate(world, entity, operand)?.to_bool()),
        Expr::Join { left, right } => {
            let mut text = evaluate(world, entity, left)?.as_text();
            text.push_str(&evaluate(world, entity, right)?.as_text());
            Value::Text(text)
        }
        Expr::LetterOf { index, text } => {
            let index = evaluate(world, entity, index)?.to_number();
            let text = evaluate(world, entity, text)?.as_text();
            let letter = if index >= 1.0 && index.fract() == 0.0 {
                text.chars()
                    .nth(index as usize - 1)
                    .map(String::from)
                    .unwrap_or_default()
            } else {
                String::new()
            };
            Value::Text(letter)
        }
        Expr::LengthOf { text } => {
            Value::Number(evaluate(world, entity, text)?.as_text().chars().count() as f64)
        }
        Expr::Contains { text, needle } => {
            let text = evaluate(world, entity, text)?.as_text().to_lowercase();
            let needle = evaluate(world, entity, needle)?.as_text().to_lowercase();
            Value::Bool(text.contains(&needle))
        }
        Expr::Round { value } => {
            Value::Number((evaluate(world, entity, value)?.to_number() + 0.5).floor())
        }
        Expr::Math { func, value } => {
            Value::Number(math(*func, evaluate(world, entity, value)?.to_number()))
        }
        Expr::Random { from, to } => {
            let from = evaluate(world, entity, from)?;
            let to = evaluate(world, entity, to)?;
            Value::Number(primitives::pick_random(world, &from, &to))
        }
        Expr::Sense { query } => primitives::query(world, entity, *query)?,
        Expr::KeyPressed { key } => {
            let key = evaluate(world, entity, key)?.as_text();
            Value::Bool(primitives::key_pressed(world, &key))
        }
        Expr::Touching { target } => {
            let target = evaluate(world, entity, target)?.as_text();
            Value::Bool(primitives::touching(world, entity, &target)?)
        }
        Expr::DistanceTo { target } => {
            let target = evaluate(world, entity, target)?.as_text();
            Value::Number(primitives::distance_to(world, entity, &target)?)
        }
    };
    Ok(value)
}

fn arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        // result takes the sign of the divisor
        ArithOp::Mod => {
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
    }
}

fn math(func: MathFunc, n: f64) -> f64 {
    match func {
        MathFunc::Abs => n.abs(),
        MathFunc::Floor => n.floor(),
        MathFunc::Ceiling => n.ceil(),
        MathFunc::Sqrt => n.sqrt(),
        MathFunc::Sin => sin_deg(n),
        MathFunc::Cos => cos_deg(n),
        MathFunc::Tan => tan_deg(n),
        MathFunc::Asin => rad_to_deg(n.asin()),
        MathFunc::Acos => rad_to_deg(n.acos()),
        MathFunc::Atan => rad_to_deg(n.atan()),
        MathFunc::Ln => n.ln(),
        MathFunc::Log => n.log10(),
        MathFunc::Exp => n.exp(),
        MathFunc::Pow10 => 10f64.powf(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::event_channel;
    use crate::ir::Query;
    use crate::options::RuntimeOptions;
    use crate::project::EntityDoc;
    use crate::world::EntitySpec;

    fn world() -> RuntimeWorld {
        let (sink, _rx) = event_channel();
        let mut world = RuntimeWorld::new(RuntimeOptions::default(), sink);
        world.load(vec![EntitySpec::from(&EntityDoc::sprite("Cat"))]);
        world
    }

    fn eval(world: &mut RuntimeWorld, expr: &Expr) -> Value {
        evaluate(world, EntityId(0), expr).unwrap()
    }

    fn bin(op: ArithOp, a: impl Into<Value>, b: impl Into<Value>) -> Expr {
        Expr::arith(op, Expr::literal(a), Expr::literal(b))
    }

    #[tokio::test]
    async fn arithmetic_uses_lenient_casts() {
        let mut w = world();
        assert_eq!(eval(&mut w, &bin(ArithOp::Add, "2", 3.0)), Value::Number(5.0));
        assert_eq!(eval(&mut w, &bin(ArithOp::Mul, "abc", 3.0)), Value::Number(0.0));
        assert_eq!(eval(&mut w, &bin(ArithOp::Mod, -1.0, 3.0)), Value::Number(2.0));
        assert_eq!(eval(&mut w, &bin(ArithOp::Mod, 7.0, -3.0)), Value::Number(-2.0));
    }

    #[tokio::test]
    async fn string_operators() {
        let mut w = world();
        let join = Expr::Join {
            left: Box::new(Expr::literal("ab")),
            right: Box::new(Expr::literal(1.0)),
        };
        assert_eq!(eval(&mut w, &join), Value::from("ab1"));
        let letter = Expr::LetterOf {
            index: Box::new(Expr::literal(2.0)),
            text: Box::new(Expr::literal("héllo")),
        };
        assert_eq!(eval(&mut w, &letter), Value::from("é"));
        let out_of_range = Expr::LetterOf {
            index: Box::new(Expr::literal(9.0)),
            text: Box::new(Expr::literal("hi")),
        };
        assert_eq!(eval(&mut w, &out_of_range), Value::from(""));
        let contains = Expr::Contains {
            text: Box::new(Expr::literal("Apple")),
            needle: Box::new(Expr::literal("PP")),
        };
        assert_eq!(eval(&mut w, &contains), Value::Bool(true));
    }

    #[tokio::test]
    async fn math_functions_work_in_degrees() {
        let mut w = world();
        let sin = Expr::Math {
            func: MathFunc::Sin,
            value: Box::new(Expr::literal(90.0)),
        };
        assert_eq!(eval(&mut w, &sin), Value::Number(1.0));
        let round = Expr::Round {
            value: Box::new(Expr::literal(-2.5)),
        };
        assert_eq!(eval(&mut w, &round), Value::Number(-2.0));
        assert_eq!(math(MathFunc::Pow10, 2.0), 100.0);
    }

    #[tokio::test]
    async fn sensing_reads_the_world() {
        let mut w = world();
        w.entities[0].x = 12.0;
        assert_eq!(eval(&mut w, &Expr::sense(Query::XPosition)), Value::Number(12.0));
        assert_eq!(eval(&mut w, &Expr::sense(Query::Direction)), Value::Number(90.0));
        w.globals.pressed_keys.insert("space".into());
        let pressed = Expr::KeyPressed {
            key: Box::new(Expr::literal("space")),
        };
        assert_eq!(eval(&mut w, &pressed), Value::Bool(true));
        let any = Expr::KeyPressed {
            key: Box::new(Expr::literal("any")),
        };
        assert_eq!(eval(&mut w, &any), Value::Bool(true));
    }

    #[test]
    fn durations_saturate() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
        assert_eq!(seconds(0.5), Duration::from_millis(500));
    }
}
