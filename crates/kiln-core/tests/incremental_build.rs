use kiln_core::{
    link_build_steps, BuildResultCode, BuildStep, Builder, BuilderOptions, Command,
    CommandContext, CommandFuture, CopyCommand, InputLocation, Mode, ResultStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// Uppercases a source file into an output file
struct Compile {
    source: PathBuf,
    output: PathBuf,
    runs: Arc<AtomicUsize>,
}

impl Command for Compile {
    fn kind(&self) -> &str {
        "compile"
    }

    fn title(&self) -> String {
        format!("compile {}", self.source.display())
    }

    fn parameters(&self) -> serde_json::Value {
        json!({ "source": self.source, "output": self.output })
    }

    fn inputs(&self) -> Vec<InputLocation> {
        vec![InputLocation::File(self.source.clone())]
    }

    fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
        Box::pin(async move {
            ctx.checkpoint().await?;
            self.runs.fetch_add(1, Ordering::SeqCst);

            let source = self.source.clone();
            let output = self.output.clone();
            ctx.offload(move || {
                let text = fs::read_to_string(&source)?;
                fs::write(&output, text.to_uppercase())?;
                Ok(())
            })
            .await?;

            ctx.logger().info(format!("compiled {}", self.source.display()));
            ctx.register_output(&self.output)?;
            Ok(ResultStatus::Successful)
        })
    }
}

/// Counts executions; declares no inputs
struct Stamp {
    runs: Arc<AtomicUsize>,
}

impl Command for Stamp {
    fn kind(&self) -> &str {
        "stamp"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({})
    }

    fn execute<'a>(&'a self, _ctx: &'a CommandContext) -> CommandFuture<'a> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ResultStatus::Successful)
        })
    }
}

/// Finishes with a fixed status after one suspension
struct Fixed {
    name: &'static str,
    status: ResultStatus,
}

impl Command for Fixed {
    fn kind(&self) -> &str {
        "fixed"
    }

    fn title(&self) -> String {
        self.name.to_string()
    }

    fn parameters(&self) -> serde_json::Value {
        json!({ "name": self.name })
    }

    fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
        Box::pin(async move {
            ctx.checkpoint().await?;
            Ok(self.status)
        })
    }
}

fn options(dir: &Path) -> BuilderOptions {
    let mut options = BuilderOptions::new(dir.join("build"), "test");
    options.thread_count = 2;
    options.persist_input_hashes = false;
    options
}

fn compile_step(source: &Path, output: &Path, runs: &Arc<AtomicUsize>) -> Arc<BuildStep> {
    let step = BuildStep::command(Compile {
        source: source.to_path_buf(),
        output: output.to_path_buf(),
        runs: runs.clone(),
    });
    step.set_tag(source.display().to_string());
    step
}

#[test]
fn unchanged_inputs_skip_execution_across_runs() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("asset.txt");
    let output = dir.path().join("asset.out");
    fs::write(&source, "h1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    // First run executes
    {
        let builder = Builder::new(options(dir.path())).unwrap();
        let step = compile_step(&source, &output, &runs);
        builder.add(step.clone()).unwrap();
        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        builder.write_index_file(true).unwrap();
        assert_eq!(step.status(), ResultStatus::Successful);
        assert_eq!(fs::read_to_string(&output).unwrap(), "H1");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Second run: nothing changed, zero executions, logs replayed
    {
        let builder = Builder::new(options(dir.path())).unwrap();
        let step = compile_step(&source, &output, &runs);
        builder.add(step.clone()).unwrap();
        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(step.status(), ResultStatus::NotTriggeredWasSuccessful);
        assert!(step
            .log_messages()
            .iter()
            .any(|m| m.text.starts_with("compiled")));
        assert_eq!(builder.stats().get(ResultStatus::NotTriggeredWasSuccessful), 1);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Third run: the input changed, so the command runs again
    fs::write(&source, "h2 is longer").unwrap();
    {
        let builder = Builder::new(options(dir.path())).unwrap();
        let step = compile_step(&source, &output, &runs);
        builder.add(step.clone()).unwrap();
        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(step.status(), ResultStatus::Successful);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(fs::read_to_string(&output).unwrap(), "H2 IS LONGER");
}

#[test]
fn deleted_output_forces_execution() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("asset.txt");
    let output = dir.path().join("asset.out");
    fs::write(&source, "content").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut builder = Builder::new(options(dir.path())).unwrap();
    builder.add(compile_step(&source, &output, &runs)).unwrap();
    builder.run(Mode::Build).unwrap();

    fs::remove_file(&output).unwrap();
    builder.reset();
    let step = compile_step(&source, &output, &runs);
    builder.add(step.clone()).unwrap();
    builder.run(Mode::Build).unwrap();

    assert_eq!(step.status(), ResultStatus::Successful);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(output.exists());
}

#[test]
fn command_without_inputs_always_runs() {
    let dir = tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut builder = Builder::new(options(dir.path())).unwrap();

    for _ in 0..2 {
        builder.reset();
        let step = BuildStep::command(Stamp { runs: runs.clone() });
        builder.add(step.clone()).unwrap();
        builder.run(Mode::Build).unwrap();
        assert_eq!(step.status(), ResultStatus::Successful);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_prerequisite_propagates_to_dependents_and_their_children() {
    let dir = tempdir().unwrap();
    let builder = Builder::new(options(dir.path())).unwrap();

    let failing = BuildStep::command(Fixed { name: "failing", status: ResultStatus::Failed });
    let dependent = BuildStep::command(Fixed { name: "dependent", status: ResultStatus::Successful });
    let group = BuildStep::list();
    let nested = BuildStep::command(Fixed { name: "nested", status: ResultStatus::Successful });
    let unrelated = BuildStep::command(Fixed { name: "unrelated", status: ResultStatus::Successful });
    group.add(nested.clone()).unwrap();

    link_build_steps(&failing, &dependent);
    link_build_steps(&failing, &group);
    for step in [&failing, &dependent, &group, &unrelated] {
        builder.add((*step).clone()).unwrap();
    }

    assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::BuildError);
    assert_eq!(failing.status(), ResultStatus::Failed);
    assert_eq!(dependent.status(), ResultStatus::NotTriggeredPrerequisiteFailed);
    assert_eq!(group.status(), ResultStatus::NotTriggeredPrerequisiteFailed);
    assert_eq!(nested.status(), ResultStatus::NotTriggeredPrerequisiteFailed);
    assert_eq!(unrelated.status(), ResultStatus::Successful);

    for step in builder.root().descendants() {
        assert!(step.is_processed(), "{} was left unprocessed", step.title());
    }
    assert_eq!(builder.stats().get(ResultStatus::NotTriggeredPrerequisiteFailed), 3);
}

#[test]
fn step_processed_fires_once_per_step() {
    let dir = tempdir().unwrap();
    let mut builder = Builder::new(options(dir.path())).unwrap();
    let seen: Arc<Mutex<HashMap<u64, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let s = seen.clone();
    builder.on_step_processed(move |step| {
        *s.lock().unwrap().entry(step.id()).or_default() += 1;
    });

    let a = BuildStep::command(Fixed { name: "a", status: ResultStatus::Successful });
    let b = BuildStep::command(Fixed { name: "b", status: ResultStatus::Failed });
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let h = handler_calls.clone();
    a.on_processed(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    builder.add(a.clone()).unwrap();
    builder.add(b.clone()).unwrap();
    builder.run(Mode::Build).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.values().all(|&count| count == 1));
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancellation_is_observed_at_next_suspension_point() {
    struct CancelsThenWaits;

    impl Command for CancelsThenWaits {
        fn kind(&self) -> &str {
            "cancels"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({})
        }

        fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                // Cancellation arrives while this step is running
                ctx.builder().cancellation().cancel();
                ctx.checkpoint().await?;
                Ok(ResultStatus::Successful)
            })
        }
    }

    let dir = tempdir().unwrap();
    let builder = Builder::new(options(dir.path())).unwrap();
    let step = BuildStep::command(CancelsThenWaits);
    let later = BuildStep::command(Fixed { name: "later", status: ResultStatus::Successful });
    link_build_steps(&step, &later);
    builder.add(step.clone()).unwrap();
    builder.add(later.clone()).unwrap();

    assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::BuildError);
    assert_eq!(step.status(), ResultStatus::Cancelled);
    assert!(later.is_processed());
    assert_ne!(later.status(), ResultStatus::Successful);
    assert_eq!(builder.root().status(), ResultStatus::Failed);
}

#[test]
fn upstream_outputs_feed_downstream_inputs() {
    struct Produce {
        target: PathBuf,
    }

    impl Command for Produce {
        fn kind(&self) -> &str {
            "produce"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({ "target": self.target })
        }

        fn inputs(&self) -> Vec<InputLocation> {
            vec![InputLocation::File(self.target.with_extension("src"))]
        }

        fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                fs::write(&self.target, "atlas")?;
                ctx.register_output(&self.target)?;
                Ok(ResultStatus::Successful)
            })
        }
    }

    struct Consume {
        url: String,
        runs: Arc<AtomicUsize>,
    }

    impl Command for Consume {
        fn kind(&self) -> &str {
            "consume"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({ "url": self.url })
        }

        fn inputs(&self) -> Vec<InputLocation> {
            vec![InputLocation::Output(self.url.clone())]
        }

        fn execute<'a>(&'a self, _ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                Ok(ResultStatus::Successful)
            })
        }
    }

    let dir = tempdir().unwrap();
    let target = dir.path().join("atlas.bin");
    fs::write(target.with_extension("src"), "sprites").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut builder = Builder::new(options(dir.path())).unwrap();

    for expected in [ResultStatus::Successful, ResultStatus::NotTriggeredWasSuccessful] {
        builder.reset();
        let producer = BuildStep::command(Produce { target: target.clone() });
        let consumer = BuildStep::command(Consume {
            url: target.display().to_string(),
            runs: runs.clone(),
        });
        link_build_steps(&producer, &consumer);
        builder.add(producer.clone()).unwrap();
        builder.add(consumer.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(producer.status(), expected);
        assert_eq!(consumer.status(), expected);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn spawned_commands_run_again_when_the_spawner_is_reused() {
    /// Reads a file list and spawns one copy per entry
    struct Bundle {
        list: PathBuf,
        runs: Arc<AtomicUsize>,
    }

    impl Command for Bundle {
        fn kind(&self) -> &str {
            "bundle"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({ "list": self.list })
        }

        fn inputs(&self) -> Vec<InputLocation> {
            vec![InputLocation::File(self.list.clone())]
        }

        fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                let dir = self.list.parent().unwrap_or(Path::new("."));
                for name in fs::read_to_string(&self.list)?.lines() {
                    let copy = CopyCommand {
                        source: dir.join(name),
                        destination: dir.join(format!("{}.copy", name)),
                    };
                    let status = ctx.spawn_command(copy.payload()).await?;
                    if !status.succeeded() {
                        return Ok(ResultStatus::Failed);
                    }
                }
                Ok(ResultStatus::Successful)
            })
        }
    }

    let dir = tempdir().unwrap();
    let list = dir.path().join("bundle.list");
    let source = dir.path().join("sprite.png");
    let copied = dir.path().join("sprite.png.copy");
    fs::write(&list, "sprite.png\n").unwrap();
    fs::write(&source, "pixels").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    {
        let builder = Builder::new(options(dir.path())).unwrap();
        let bundle = BuildStep::command(Bundle { list: list.clone(), runs: runs.clone() });
        builder.add(bundle.clone()).unwrap();
        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(bundle.status(), ResultStatus::Successful);
        let spawned = bundle.spawned_steps();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].status(), ResultStatus::Successful);
        assert_eq!(builder.stats().total(), 3);
    }
    assert_eq!(fs::read_to_string(&copied).unwrap(), "pixels");

    // The bundle is reused, but its copy has to be redone
    fs::remove_file(&copied).unwrap();
    {
        let builder = Builder::new(options(dir.path())).unwrap();
        let bundle = BuildStep::command(Bundle { list: list.clone(), runs: runs.clone() });
        builder.add(bundle.clone()).unwrap();
        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(bundle.status(), ResultStatus::NotTriggeredWasSuccessful);
        let spawned = bundle.spawned_steps();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].status(), ResultStatus::Successful);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(&copied).unwrap(), "pixels");
}
