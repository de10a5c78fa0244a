use sbstage_core::bridge::{event_channel, HostEvent};
use sbstage_core::ir::{CompareOp, EntityProgram, Expr, Program, Query, Script, Stmt, StopScope};
use sbstage_core::options::RuntimeOptions;
use sbstage_core::project::EntityDoc;
use sbstage_core::scheduler::Runtime;
use sbstage_core::value::Value;
use sbstage_core::world::{EntityId, EntitySpec};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::LocalSet;

struct Harness {
    runtime: Runtime,
    events: UnboundedReceiver<HostEvent>,
}

impl Harness {
    fn new(names: &[&str], programs: Vec<EntityProgram>) -> Self {
        let (sink, events) = event_channel();
        let runtime = Runtime::new(RuntimeOptions::default(), sink);
        let entities = names
            .iter()
            .map(|n| EntitySpec::from(&EntityDoc::sprite(n)))
            .collect();
        runtime.load(entities, Program { entities: programs });
        Self { runtime, events }
    }

    fn drain(&mut self) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn var(&self, name: &str) -> Option<Value> {
        self.runtime
            .with_world(|w| w.variable(EntityId(0), name).map(|v| v.value.clone()))
    }

    fn position(&self, entity: usize) -> (f64, f64) {
        self.runtime.with_world(|w| {
            let e = &w.entities[entity];
            (e.x, e.y)
        })
    }
}

fn script(body: Vec<Stmt>) -> Script {
    Script {
        hat: "hat".into(),
        body,
    }
}

fn on_start(body: Vec<Stmt>) -> EntityProgram {
    EntityProgram {
        on_start: Some(script(body)),
        ..EntityProgram::default()
    }
}

fn on_message(name: &str, body: Vec<Stmt>) -> EntityProgram {
    let mut program = EntityProgram::default();
    program.on_message.insert(name.into(), vec![script(body)]);
    program
}

fn set(name: &str, value: impl Into<Value>) -> Stmt {
    Stmt::SetVar {
        name: name.into(),
        value: Expr::literal(value),
    }
}

fn wait(secs: f64) -> Stmt {
    Stmt::Wait {
        secs: Expr::literal(secs),
    }
}

async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn compare(op: CompareOp, name: &str, value: f64) -> Expr {
    Expr::Compare {
        op,
        left: Box::new(Expr::var(name)),
        right: Box::new(Expr::literal(value)),
    }
}

fn glide(secs: f64, x: f64, y: f64) -> Stmt {
    Stmt::Glide {
        secs: Expr::literal(secs),
        x: Expr::literal(x),
        y: Expr::literal(y),
    }
}

fn moves_of(events: &[HostEvent], entity: EntityId) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, HostEvent::EntityStateChanged { entity: id, .. } if *id == entity))
        .count()
}

#[tokio::test(start_paused = true)]
async fn move_by_updates_stage_and_canvas_position() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new(
                &["Cat"],
                vec![on_start(vec![
                    Stmt::MoveBy {
                        dx: Expr::literal(10.0),
                        dy: Expr::literal(0.0),
                    },
                    Stmt::MoveBy {
                        dx: Expr::literal(0.0),
                        dy: Expr::literal(-10.0),
                    },
                ])],
            );
            h.runtime.start();
            advance(50).await;
            assert_eq!(h.position(0), (10.0, -10.0));
            let moved = h.drain().into_iter().any(|e| match e {
                HostEvent::EntityStateChanged { entity, patch } => {
                    entity == EntityId(0)
                        && patch.canvas_x == Some(250.0)
                        && patch.canvas_y == Some(190.0)
                }
                _ => false,
            });
            assert!(moved);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn set_then_change_variable() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat"],
                vec![on_start(vec![
                    set("score", 0.0),
                    Stmt::ChangeVar {
                        name: "score".into(),
                        delta: Expr::literal(5.0),
                    },
                    Stmt::ChangeVar {
                        name: "score".into(),
                        delta: Expr::literal(5.0),
                    },
                ])],
            );
            h.runtime.start();
            advance(50).await;
            assert_eq!(h.var("score"), Some(Value::Number(10.0)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn repeated_broadcast_runs_listener_each_time() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat", "Dog"],
                vec![
                    on_start(vec![Stmt::RepeatN {
                        times: Expr::literal(3.0),
                        body: vec![
                            Stmt::Broadcast {
                                message: Expr::literal("ping"),
                            },
                            Stmt::Yield,
                        ],
                    }]),
                    on_message(
                        "ping",
                        vec![Stmt::ChangeVar {
                            name: "count".into(),
                            delta: Expr::literal(1.0),
                        }],
                    ),
                ],
            );
            h.runtime.start();
            advance(100).await;
            assert_eq!(h.var("count"), Some(Value::Number(3.0)));
            assert_eq!(h.runtime.history().len(), 3);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn broadcast_fans_out_to_every_listener() {
    LocalSet::new()
        .run_until(async {
            let listener = || on_message("go", vec![wait(1.0)]);
            let mut h = Harness::new(
                &["A", "B", "C"],
                vec![listener(), listener(), listener()],
            );
            h.runtime.start();
            assert_eq!(h.runtime.broadcast("go", EntityId(0)), 3);
            assert_eq!(h.runtime.broadcast("nobody", EntityId(1)), 0);
            let history = h.runtime.history();
            assert_eq!(history.len(), 2);
            assert!(history[1].received_by.is_empty());
            let observed = h
                .drain()
                .into_iter()
                .filter(|e| matches!(e, HostEvent::MessageBroadcastObserved { .. }))
                .count();
            assert_eq!(observed, 2);
        })
        .await;
}

// Real time: a busy loop keeps the paused clock from auto-advancing.
#[tokio::test]
async fn forever_loop_does_not_starve_other_scripts() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Spinner", "Sleeper"],
                vec![
                    on_start(vec![Stmt::Forever {
                        body: vec![
                            Stmt::ChangeVar {
                                name: "spins".into(),
                                delta: Expr::literal(1.0),
                            },
                            Stmt::Yield,
                        ],
                    }]),
                    on_start(vec![wait(0.05), set("done", "yes")]),
                ],
            );
            h.runtime.start();
            advance(300).await;
            assert_eq!(h.var("done"), Some(Value::from("yes")));
            assert!(h.var("spins").map(|v| v.to_number()).unwrap_or(0.0) > 1.0);
            h.runtime.stop();
            advance(20).await;
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn no_state_changes_after_stop() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new(
                &["Cat"],
                vec![on_start(vec![Stmt::Forever {
                    body: vec![
                        Stmt::MoveBy {
                            dx: Expr::literal(1.0),
                            dy: Expr::literal(0.0),
                        },
                        wait(0.01),
                    ],
                }])],
            );
            h.runtime.start();
            advance(100).await;
            h.runtime.stop();
            advance(100).await;
            let events = h.drain();
            let stopped = events
                .iter()
                .position(|e| *e == HostEvent::ExecutionStopped)
                .expect("stop event");
            let changed = |e: &HostEvent| matches!(e, HostEvent::EntityStateChanged { .. });
            assert!(events[..stopped].iter().any(changed));
            assert!(!events[stopped..].iter().any(changed));
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn broadcast_and_wait_holds_for_a_fixed_time() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat", "Dog"],
                vec![
                    on_start(vec![
                        Stmt::BroadcastAndWait {
                            message: Expr::literal("go"),
                            secs: Expr::literal(1.0),
                        },
                        set("done", 1.0),
                    ]),
                    on_message("go", vec![wait(10.0)]),
                ],
            );
            h.runtime.start();
            advance(500).await;
            assert_eq!(h.var("done"), None);
            advance(1000).await;
            assert_eq!(h.var("done"), Some(Value::Number(1.0)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn stop_this_script_leaves_other_scripts_running() {
    LocalSet::new()
        .run_until(async {
            let mut program = on_start(vec![
                Stmt::Broadcast {
                    message: Expr::literal("side"),
                },
                Stmt::Stop {
                    scope: StopScope::ThisScript,
                },
                set("after_stop", 1.0),
            ]);
            program
                .on_message
                .insert("side".into(), vec![script(vec![wait(0.1), set("side", 1.0)])]);
            let h = Harness::new(&["Cat"], vec![program]);
            h.runtime.start();
            advance(1000).await;
            assert_eq!(h.var("after_stop"), None);
            assert_eq!(h.var("side"), Some(Value::Number(1.0)));
            assert!(h.runtime.is_running());
            assert_eq!(h.runtime.stats().completed, 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn stop_this_sprite_spares_other_sprites() {
    LocalSet::new()
        .run_until(async {
            let mut cat = on_start(vec![
                Stmt::Broadcast {
                    message: Expr::literal("x"),
                },
                wait(0.1),
                Stmt::Stop {
                    scope: StopScope::ThisSprite,
                },
            ]);
            cat.on_message
                .insert("x".into(), vec![script(vec![wait(1.0), set("cat_done", 1.0)])]);
            let dog = on_message("x", vec![wait(1.0), set("dog_done", 1.0)]);
            let h = Harness::new(&["Cat", "Dog"], vec![cat, dog]);
            h.runtime.start();
            advance(2000).await;
            assert_eq!(h.var("cat_done"), None);
            assert_eq!(h.var("dog_done"), Some(Value::Number(1.0)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn failures_are_isolated_and_reported_once() {
    LocalSet::new()
        .run_until(async {
            let mut cat = EntityProgram::default();
            cat.on_key.insert(
                "space".into(),
                vec![script(vec![Stmt::MoveTo {
                    x: Expr::literal("abc"),
                    y: Expr::literal(0.0),
                }])],
            );
            let dog = on_start(vec![wait(0.1), set("ok", 1.0)]);
            let mut h = Harness::new(&["Cat", "Dog"], vec![cat, dog]);
            h.runtime.start();
            h.runtime.key_down("space");
            advance(10).await;
            h.runtime.key_down("space");
            advance(500).await;
            let errors = h
                .drain()
                .into_iter()
                .filter(|e| {
                    matches!(
                        e,
                        HostEvent::RuntimeError {
                            entity: Some(EntityId(0)),
                            ..
                        }
                    )
                })
                .count();
            assert_eq!(errors, 1);
            assert_eq!(h.runtime.stats().failed, 2);
            assert_eq!(h.var("ok"), Some(Value::Number(1.0)));
            assert_eq!(h.position(0), (0.0, 0.0));
        })
        .await;
}

fn follow_mouse() -> EntityProgram {
    on_start(vec![
        Stmt::SyncMouse,
        Stmt::MoveTo {
            x: Expr::sense(Query::MouseX),
            y: Expr::sense(Query::MouseY),
        },
    ])
}

#[tokio::test(start_paused = true)]
async fn unanswered_mouse_request_keeps_last_position() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new(&["Cat"], vec![follow_mouse()]);
            h.runtime.start();
            advance(200).await;
            assert!(h
                .drain()
                .iter()
                .any(|e| matches!(e, HostEvent::MousePositionRequest { .. })));
            assert!(h.runtime.task_states().is_empty());
            assert_eq!(h.position(0), (0.0, 0.0));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn answered_mouse_request_moves_to_the_pointer() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(&["Cat"], vec![follow_mouse()]);
            h.runtime.start();
            advance(1).await;
            h.runtime.mouse_position(30.0, 40.0);
            advance(10).await;
            assert_eq!(h.position(0), (30.0, 40.0));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn glide_moves_once_per_tick_until_it_arrives() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new(
                &["Cat"],
                vec![on_start(vec![glide(1.0, 100.0, 0.0), set("landed", 1.0)])],
            );
            h.runtime.start();
            advance(500).await;
            let steps = moves_of(&h.drain(), EntityId(0));
            assert!((20..=40).contains(&steps), "{} glide steps in 500 ms", steps);
            let (x, y) = h.position(0);
            assert!(x > 0.0 && x < 100.0, "x = {}", x);
            assert_eq!(y, 0.0);
            assert_eq!(h.var("landed"), None);
            assert_eq!(h.runtime.task_states().len(), 1);

            advance(1000).await;
            assert_eq!(h.position(0), (100.0, 0.0));
            assert_eq!(h.var("landed"), Some(Value::Number(1.0)));
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn stop_freezes_a_glide_midway() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new(&["Cat"], vec![on_start(vec![glide(1.0, 100.0, 0.0)])]);
            h.runtime.start();
            advance(300).await;
            h.runtime.stop();
            let (frozen, _) = h.position(0);
            advance(1000).await;
            let events = h.drain();
            let stopped = events
                .iter()
                .position(|e| *e == HostEvent::ExecutionStopped)
                .expect("stop event");
            assert!(moves_of(&events[..stopped], EntityId(0)) > 0);
            assert_eq!(moves_of(&events[stopped..], EntityId(0)), 0);
            assert_eq!(h.position(0).0, frozen);
            assert!(frozen > 0.0 && frozen < 100.0);
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn wait_until_polls_until_another_script_opens_the_gate() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat", "Dog"],
                vec![
                    on_start(vec![
                        set("gate", 0.0),
                        Stmt::WaitUntil {
                            condition: compare(CompareOp::Eq, "gate", 1.0),
                            sync_mouse: false,
                        },
                        set("released", 1.0),
                    ]),
                    on_start(vec![wait(0.2), set("gate", 1.0)]),
                ],
            );
            h.runtime.start();
            advance(100).await;
            assert_eq!(h.var("released"), None);
            assert_eq!(h.runtime.task_states().len(), 2);
            advance(200).await;
            assert_eq!(h.var("released"), Some(Value::Number(1.0)));
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn repeat_until_stops_once_the_condition_holds() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat"],
                vec![on_start(vec![
                    set("n", 0.0),
                    Stmt::RepeatUntil {
                        condition: compare(CompareOp::Gt, "n", 4.0),
                        body: vec![
                            Stmt::ChangeVar {
                                name: "n".into(),
                                delta: Expr::literal(1.0),
                            },
                            wait(0.01),
                        ],
                    },
                    set("done", 1.0),
                ])],
            );
            h.runtime.start();
            advance(500).await;
            assert_eq!(h.var("n"), Some(Value::Number(5.0)));
            assert_eq!(h.var("done"), Some(Value::Number(1.0)));
            assert!(h.runtime.task_states().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn restarting_keeps_one_listener_per_script() {
    LocalSet::new()
        .run_until(async {
            let h = Harness::new(
                &["Cat", "Dog"],
                vec![
                    on_message(
                        "go",
                        vec![Stmt::ChangeVar {
                            name: "count".into(),
                            delta: Expr::literal(1.0),
                        }],
                    ),
                    EntityProgram::default(),
                ],
            );
            for _ in 0..3 {
                h.runtime.start();
                advance(10).await;
            }
            assert_eq!(h.runtime.broadcast("go", EntityId(1)), 1);
            advance(10).await;
            assert_eq!(h.var("count"), Some(Value::Number(1.0)));
            let history = h.runtime.history();
            assert_eq!(history.last().map(|r| r.received_by.len()), Some(1));
        })
        .await;
}
