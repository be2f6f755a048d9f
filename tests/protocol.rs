#![cfg(unix)]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use match_runtime::{prelude::*, process::Suspension};
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

struct CustomLevelFilter;
impl<S> Filter<S> for CustomLevelFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() <= &Level::DEBUG
    }
}

fn init_debug_logger() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_thread_names(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_test_writer()
            .with_filter(CustomLevelFilter),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

fn bot(name: &str) -> AgentSource {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "dummy_agents", name]
        .iter()
        .collect();
    AgentSource::new(path).with_command("sh")
}

fn timing(per_step_ms: u64, overage_ms: u64) -> ProcessOptions {
    ProcessOptionsBuilder::new()
        .with_per_step(Duration::from_millis(per_step_ms))
        .with_overage(Duration::from_millis(overage_ms))
        .build()
        .unwrap()
}

fn setup(bots: &[&str], process_options: ProcessOptions, options: EngineOptions) -> (Engine, Vec<Agent>) {
    init_debug_logger();
    let mut agents = generate_agents(
        bots.iter().map(|name| bot(name)),
        &process_options,
        &Backend::Local,
    )
    .unwrap();
    let engine = Engine::new(options);
    let failures = engine.initialize_agents(&mut agents);
    assert!(failures.is_empty(), "{failures:?}");
    (engine, agents)
}

fn step(engine: &Engine, agents: &mut [Agent]) -> StepOutcome {
    engine.collect_commands(&StepInput::broadcast(["state"]), agents)
}

#[test]
fn agents_are_ready_and_paused_after_initialization() {
    let (engine, agents) = setup(
        &["counter.sh", "echo_agent.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    for agent in &agents {
        assert_eq!(agent.status(), AgentStatus::Ready);
        assert_eq!(agent.suspension(), Some(Suspension::Applied));
    }
    assert_eq!(engine.registry().len(), 2);
}

#[test]
fn finish_symbol_truncates_the_turn() {
    let (engine, mut agents) = setup(
        &["finish_then_noise.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    for _ in 0..3 {
        let outcome = step(&engine, &mut agents);
        assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
        assert_eq!(outcome.commands_of(AgentId(0)), vec!["R"]);
    }
    assert_eq!(agents[0].status(), AgentStatus::Stopped);
}

#[test]
fn line_count_defers_extra_lines() {
    let options = EngineOptions::new()
        .with_finish_policy(FinishPolicy::LineCount)
        .with_max_lines(1);
    let (engine, mut agents) = setup(&["two_lines.sh"], timing(1000, 1000), options);

    let first = step(&engine, &mut agents);
    assert_eq!(first.commands_of(AgentId(0)), vec!["R"]);
    let second = step(&engine, &mut agents);
    assert_eq!(second.commands_of(AgentId(0)), vec!["S"]);
}

#[test]
fn line_count_accepts_up_to_max_lines() {
    let options = EngineOptions::new()
        .with_finish_policy(FinishPolicy::LineCount)
        .with_max_lines(2);
    let (engine, mut agents) = setup(&["two_lines.sh"], timing(1000, 1000), options);

    for _ in 0..2 {
        let outcome = step(&engine, &mut agents);
        assert_eq!(outcome.commands_of(AgentId(0)), vec!["R", "S"]);
    }
}

#[test]
fn partial_lines_count_without_waiting_for_newline() {
    let options = EngineOptions::new()
        .with_finish_policy(FinishPolicy::LineCount)
        .with_wait_for_newline(false);
    let (engine, mut agents) = setup(&["no_newline.sh"], timing(1000, 1000), options);

    let outcome = step(&engine, &mut agents);
    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["R"]);
}

#[test]
fn commands_are_split_and_tagged() {
    let (engine, mut agents) = setup(
        &["multi_commands.sh", "echo_agent.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    let outcome = step(&engine, &mut agents);
    assert_eq!(
        outcome.commands,
        vec![
            Command {
                agent_id: AgentId(0),
                command: "move a b 3".to_string()
            },
            Command {
                agent_id: AgentId(0),
                command: "run 24 d".to_string()
            },
            Command {
                agent_id: AgentId(1),
                command: "echo state".to_string()
            },
        ]
    );

    let mut parsed = ParsedCommand::new(&outcome.commands[0].command, " ");
    assert_eq!(parsed.next_str().unwrap(), "move");
    assert_eq!(parsed.next_str_arr().unwrap(), vec!["a", "b", "3"]);
}

#[test]
fn agent_state_survives_pauses() {
    let (engine, mut agents) = setup(&["counter.sh"], timing(1000, 1000), EngineOptions::new());
    for turn in 1..=4 {
        let outcome = step(&engine, &mut agents);
        assert_eq!(outcome.commands_of(AgentId(0)), vec![format!("turn {turn}")]);
    }
}

#[test]
fn per_agent_input() {
    let (engine, mut agents) = setup(
        &["echo_agent.sh", "echo_agent.sh"],
        timing(1000, 1000),
        EngineOptions::new().with_delimiter(";"),
    );
    let input = StepInput::new()
        .with_agent_input(AgentId(0), ["left"])
        .with_agent_input(AgentId(1), ["right"]);
    let outcome = engine.collect_commands(&input, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["echo left"]);
    assert_eq!(outcome.commands_of(AgentId(1)), vec!["echo right"]);
}

#[test]
fn agent_arguments_are_passed() {
    init_debug_logger();
    let mut agents = generate_agents(
        [bot("args_agent.sh").with_args(&["--level", "3"])],
        &timing(1000, 1000),
        &Backend::Local,
    )
    .unwrap();
    let engine = Engine::new(EngineOptions::new());
    assert!(engine.initialize_agents(&mut agents).is_empty());
    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["--level 3"]);
}

#[test]
fn slow_agent_runs_out_of_overage() {
    let (engine, mut agents) = setup(&["slow_agent.sh"], timing(100, 300), EngineOptions::new());

    let first = step(&engine, &mut agents);
    assert_eq!(first.commands_of(AgentId(0)), vec!["slow"]);
    assert!(agents[0].budget().remaining_overage() < Duration::from_millis(300));

    let mut turns = 1;
    while agents[0].is_active() && turns < 10 {
        step(&engine, &mut agents);
        turns += 1;
    }
    assert_eq!(agents[0].status(), AgentStatus::Crashed);
    assert!(agents[0].budget().is_exhausted());
    assert!((3..=5).contains(&turns), "crashed after {turns} turns");
}

#[test]
fn unresponsive_agent_hits_the_deadline() {
    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    let options = EngineOptions::new().with_timeout_callback(move |_, err| {
        assert!(err.is_timeout());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (engine, mut agents) = setup(&["does_not_respond.sh"], timing(100, 100), options);

    let start = Instant::now();
    let outcome = step(&engine, &mut agents);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        outcome.failure_of(AgentId(0)),
        Some(AgentError::Timeout(TimeoutKind::Deadline { .. }))
    ));
    assert_eq!(agents[0].status(), AgentStatus::Crashed);
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(engine.registry().is_empty());

    // crashed agents take no further turns
    let outcome = step(&engine, &mut agents);
    assert!(outcome.failures.is_empty());
    assert!(outcome.commands.is_empty());
}

#[test]
fn disabled_timeouts_never_fire() {
    let options = EngineOptions::new().with_timeout_active(false);
    let (engine, mut agents) = setup(&["slow_agent.sh"], timing(1, 1), options);
    for _ in 0..2 {
        let outcome = step(&engine, &mut agents);
        assert_eq!(outcome.commands_of(AgentId(0)), vec!["slow"]);
    }
    assert!(agents[0].is_active());
}

#[test]
fn premature_exit_kills_the_agent() {
    let (engine, mut agents) = setup(&["exits_early.sh"], timing(1000, 1000), EngineOptions::new());

    let outcome = step(&engine, &mut agents);
    assert!(matches!(
        outcome.failure_of(AgentId(0)),
        Some(AgentError::PrematureExit { code: Some(3) })
    ));
    assert_eq!(agents[0].status(), AgentStatus::Killed);
    assert!(agents[0].is_terminated());
}

#[test]
fn exit_between_turns_is_a_premature_exit() {
    let (engine, mut agents) = setup(&["answers_once.sh"], timing(1000, 1000), EngineOptions::new());

    let first = step(&engine, &mut agents);
    assert!(first.failures.is_empty(), "{:?}", first.failures);
    assert_eq!(first.commands_of(AgentId(0)), vec!["R"]);

    let second = step(&engine, &mut agents);
    assert!(
        matches!(
            second.failure_of(AgentId(0)),
            Some(AgentError::PrematureExit { code: Some(0) })
        ),
        "{:?}",
        second.failures
    );
    assert_eq!(agents[0].status(), AgentStatus::Killed);
}

#[test]
fn unread_input_does_not_stall_the_step() {
    let (engine, mut agents) = setup(&["never_reads.sh"], timing(100, 100), EngineOptions::new());

    let start = Instant::now();
    let input = StepInput::broadcast(["x".repeat(200_000)]);
    let outcome = engine.collect_commands(&input, &mut agents);
    assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    assert!(outcome.failure_of(AgentId(0)).is_some_and(AgentError::is_timeout));
    assert_eq!(agents[0].status(), AgentStatus::Crashed);
}

#[test]
fn turns_are_isolated() {
    let (engine, mut agents) = setup(
        &["echo_agent.sh", "does_not_respond.sh", "slow_agent.sh"],
        timing(300, 0),
        EngineOptions::new(),
    );

    let start = Instant::now();
    let outcome = step(&engine, &mut agents);
    // turns run side by side: the whole step costs about one deadline
    assert!(start.elapsed() < Duration::from_millis(900));

    assert_eq!(outcome.commands_of(AgentId(0)), vec!["echo state"]);
    assert!(outcome.failure_of(AgentId(1)).is_some_and(AgentError::is_timeout));
    assert_eq!(outcome.commands_of(AgentId(2)), vec!["slow"]);
    assert_eq!(agents[0].status(), AgentStatus::Stopped);
    assert_eq!(agents[1].status(), AgentStatus::Crashed);
    assert_eq!(agents[2].status(), AgentStatus::Stopped);

    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["echo state"]);
    assert_eq!(outcome.commands_of(AgentId(2)), vec!["slow"]);
}

#[test]
fn send_outside_of_a_turn() {
    let (engine, mut agents) = setup(
        &["echo_agent.sh", "echo_agent.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    assert!(engine.send(&mut agents[0], "hello"));
    engine.kill(&mut agents[1]);
    assert!(!engine.send(&mut agents[1], "hello"));

    // the paused agent reads the message as soon as its next turn starts
    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["echo hello"]);
}

#[test]
fn finished_agents_are_closed() {
    let (engine, mut agents) = setup(
        &["counter.sh", "counter.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    engine.handle_agents(&mut agents, &[AgentId(1)]);
    assert!(agents[1].is_terminated());
    assert_eq!(engine.registry().len(), 1);

    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["turn 1"]);
    assert!(outcome.commands_of(AgentId(1)).is_empty());
}

#[test]
fn stop_and_resume_the_match() {
    let (engine, mut agents) = setup(&["counter.sh"], timing(1000, 1000), EngineOptions::new());
    step(&engine, &mut agents);
    engine.resume(&mut agents);
    assert_eq!(agents[0].status(), AgentStatus::Running);
    engine.stop(&mut agents);
    assert_eq!(agents[0].status(), AgentStatus::Stopped);
    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["turn 2"]);
}

#[test]
fn kill_and_clean_leaves_nothing_behind() {
    let (engine, mut agents) = setup(
        &["counter.sh", "slow_agent.sh", "does_not_respond.sh"],
        timing(1000, 1000),
        EngineOptions::new(),
    );
    let processes: Vec<_> = agents
        .iter()
        .map(|a| a.process().unwrap().clone())
        .collect();

    engine.kill_and_clean(&mut agents);
    assert!(engine.registry().is_empty());
    assert!(agents.iter().all(Agent::is_terminated));
    assert!(processes.iter().all(|p| p.is_closed()));

    // late initializations are killed right away
    let mut late = generate_agents([bot("counter.sh")], &timing(1000, 1000), &Backend::Local).unwrap();
    assert!(engine.initialize_agents(&mut late).is_empty());
    assert!(late[0].is_terminated());
}

#[test]
fn stderr_is_stored_in_error_logs() {
    let dir = tempfile::tempdir().unwrap();
    let options = EngineOptions::new()
        .with_error_log_dir(dir.path())
        .with_debug_agent_stderr(true);
    let (engine, mut agents) = setup(&["chatty_stderr.sh"], timing(1000, 1000), options);

    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["ok"]);

    let log = dir.path().join("agent_0.log");
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut content = String::new();
    while Instant::now() < deadline {
        content = std::fs::read_to_string(&log).unwrap_or_default();
        if content.contains("thinking about state") {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(content.contains("thinking about state"), "{content:?}");
}

#[test]
fn missing_interpreter_crashes_only_that_agent() {
    init_debug_logger();
    let mut agents = generate_agents(
        [
            bot("counter.sh"),
            bot("counter.sh").with_command("/no/such/interpreter"),
        ],
        &timing(1000, 1000),
        &Backend::Local,
    )
    .unwrap();
    let engine = Engine::new(EngineOptions::new());
    let failures = engine.initialize_agents(&mut agents);
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], (AgentId(1), AgentError::Spawn(_))));
    assert_eq!(agents[1].status(), AgentStatus::Crashed);

    let outcome = step(&engine, &mut agents);
    assert_eq!(outcome.commands_of(AgentId(0)), vec!["turn 1"]);
}
