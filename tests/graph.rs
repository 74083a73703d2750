use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use filer::{
    BuildConfig, BuildConfigInput, BuildContext, BuildDependency, BuildFile, BuildResult, BuildSource, Builder,
    BuilderError, DirChange, DirChangeKind, DirId, Filer, FilerError, FilerOptions, PathStats, Platform,
};

/// Compiles `.ts` sources to `.js` unchanged. Every `import <name>` line is
/// reported as a dependency on `<name>.ts` next to the source, `import
/// npm:<name>` as an external one. A source containing `!error` fails to
/// compile.
#[derive(Clone, Default)]
struct ImportBuilder {
    calls: Arc<Mutex<HashMap<(Utf8PathBuf, String), usize>>>,
    removes: Arc<Mutex<usize>>,
    delay: Duration,
    /// Only builds for this config are delayed, when set.
    slow_config: Option<String>,
    fail_removes: bool,
}

impl ImportBuilder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn slow_for(name: &str, delay: Duration) -> Self {
        Self {
            delay,
            slow_config: Some(name.to_string()),
            ..Self::default()
        }
    }

    fn failing_removes() -> Self {
        Self {
            fail_removes: true,
            ..Self::default()
        }
    }

    fn calls(&self, id: &Utf8Path, name: &str) -> usize {
        let calls = self.calls.lock().unwrap();
        calls.get(&(id.to_path_buf(), name.to_string())).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn removes(&self) -> usize {
        *self.removes.lock().unwrap()
    }
}

#[async_trait]
impl Builder for ImportBuilder {
    fn name(&self) -> &str {
        "imports"
    }

    async fn build(
        &self,
        source: &BuildSource,
        config: &BuildConfig,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let delayed = self.slow_config.as_ref().is_none_or(|name| *name == config.name);
        if delayed && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self
            .calls
            .lock()
            .unwrap()
            .entry((source.id.clone(), config.name.clone()))
            .or_default() += 1;

        let text = source.content.as_str().unwrap_or_default();
        if text.contains("!error") {
            anyhow::bail!("syntax error in {}", source.id);
        }
        let dependencies = text
            .lines()
            .filter_map(|line| line.strip_prefix("import "))
            .map(|name| {
                let name = name.trim();
                match name.strip_prefix("npm:") {
                    Some(package) => BuildDependency::new(name, package).external(),
                    None => {
                        let id = source.id.with_file_name(format!("{name}.ts"));
                        BuildDependency::new(name, ctx.build_out_id(config, &id, "js"))
                    }
                }
            })
            .collect();

        let id = ctx.build_out_id(config, &source.id, "js");
        let file = BuildFile::new(id, &source.id, &config.name, source.content.clone())
            .with_dependencies(dependencies);
        Ok(BuildResult::new(vec![file]))
    }

    async fn on_remove(
        &self,
        source: &BuildSource,
        _config: &BuildConfig,
        _ctx: &BuildContext,
    ) -> Result<(), BuilderError> {
        *self.removes.lock().unwrap() += 1;
        if self.fail_removes {
            anyhow::bail!("cleanup of {} failed", source.id);
        }
        Ok(())
    }
}

struct Project {
    _guard: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Project {
    fn new(files: &[(&str, &str)]) -> Self {
        let guard = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(guard.path().canonicalize().unwrap()).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();

        let project = Self { _guard: guard, root };
        for (name, content) in files {
            project.write(name, content);
        }
        project
    }

    fn src(&self, name: &str) -> Utf8PathBuf {
        self.root.join("src").join(name)
    }

    fn out(&self, config: &str, name: &str) -> Utf8PathBuf {
        self.root.join(".filer/dev").join(config).join("src").join(name)
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.src(name), content).unwrap();
    }

    /// One config per distinct name, each `(name, input)` pair adding an
    /// input.
    fn filer(&self, builder: &ImportBuilder, inputs: &[(&str, &str)]) -> Filer {
        let mut configs: Vec<BuildConfig> = Vec::new();
        for (name, input) in inputs {
            let input = BuildConfigInput::path(self.src(input));
            match configs.iter_mut().position(|config| config.name == *name) {
                Some(i) => configs[i].input.push(input),
                None => configs.push(BuildConfig::new(*name, Platform::Node).with_input(input)),
            }
        }

        FilerOptions::new(&self.root)
            .source_dir("src")
            .builder(builder.clone())
            .build_configs(configs)
            .build()
            .unwrap()
    }
}

fn change(kind: DirChangeKind, path: &str) -> DirChange {
    DirChange {
        kind,
        path: path.into(),
        stats: PathStats {
            is_directory: false,
            size: 0,
            modified: None,
        },
    }
}

fn is_member(filer: &Filer, id: &Utf8Path, name: &str) -> bool {
    filer
        .source_file(id)
        .is_some_and(|file| file.build_configs.contains(name))
}

/// Every resolved dependency edge is mirrored by a dependent edge carrying
/// the same build ids, and the other way around.
fn assert_mirrored(filer: &Filer) {
    for id in filer.source_ids() {
        let file = filer.source_file(&id).unwrap();

        for (name, dependencies) in &file.dependencies {
            for (dependency_id, edges) in dependencies {
                let Some(dependency) = filer.source_file(dependency_id) else {
                    continue;
                };
                let mirrored = &dependency.dependents[name][&id];
                assert_eq!(mirrored.keys().collect::<Vec<_>>(), edges.keys().collect::<Vec<_>>());
            }
        }

        for (name, dependents) in &file.dependents {
            for (dependent_id, edges) in dependents {
                let dependent = filer.source_file(dependent_id).unwrap();
                let mirrored = &dependent.dependencies[name][&id];
                assert_eq!(mirrored.keys().collect::<Vec<_>>(), edges.keys().collect::<Vec<_>>());
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dependencies_join_the_build() {
    let project = Project::new(&[
        ("a.ts", "import b\nimport npm:react\n"),
        ("b.ts", "import c\n"),
        ("c.ts", "export const c = 1;\n"),
        ("d.ts", "export const d = 1;\n"),
    ]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();

    for name in ["a.ts", "b.ts", "c.ts"] {
        assert!(is_member(&filer, &project.src(name), "node"), "{name} should be built");
        assert!(project.out("node", &name.replace(".ts", ".js")).is_file());
        assert_eq!(builder.calls(&project.src(name), "node"), 1);
    }
    assert!(!is_member(&filer, &project.src("d.ts"), "node"));
    assert!(!project.out("node", "d.js").exists());

    let a = filer.source_file(project.src("a.ts")).unwrap();
    assert!(a.is_input_to("node"));
    assert!(!filer.source_file(project.src("b.ts")).unwrap().is_input_to("node"));
    // External imports never become edges.
    assert_eq!(a.dependencies["node"].len(), 1);

    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchanged_content_is_not_rebuilt() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    assert_eq!(builder.calls(&project.src("a.ts"), "node"), 1);

    project.write("a.ts", "export const a = 2;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();
    assert_eq!(builder.calls(&project.src("a.ts"), "node"), 2);

    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();
    assert_eq!(builder.calls(&project.src("a.ts"), "node"), 2);

    let out = std::fs::read_to_string(project.out("node", "a.js")).unwrap();
    assert_eq!(out, "export const a = 2;\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overlapping_builds_compile_once_more() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::slow(Duration::from_millis(50));
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();

    let id = project.src("a.ts");
    assert_eq!(builder.calls(&id, "node"), 1);

    // The first request compiles what's in memory, the others wait for it.
    // The new content on disk is picked up by exactly one follow-up compile.
    project.write("a.ts", "export const a = 3;\n");
    let requests = (0..5).map(|_| filer.build_source_file(&id, "node"));
    for result in futures::future::join_all(requests).await {
        result.unwrap();
    }

    assert_eq!(builder.calls(&id, "node"), 3);
    let out = filer.build_file(project.out("node", "a.js")).unwrap();
    assert_eq!(out.content.as_str(), Some("export const a = 3;\n"));

    // Nothing changed: the queued requests collapse into nothing.
    let requests = (0..5).map(|_| filer.build_source_file(&id, "node"));
    for result in futures::future::join_all(requests).await {
        result.unwrap();
    }
    assert_eq!(builder.calls(&id, "node"), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removed_import_leaves_the_build() {
    let project = Project::new(&[
        ("a.ts", "import b\n"),
        ("b.ts", "import c\n"),
        ("c.ts", "export const c = 1;\n"),
    ]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    assert!(project.out("node", "b.js").is_file());
    assert!(project.out("node", "c.js").is_file());

    project.write("a.ts", "export const a = 1;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();

    assert!(is_member(&filer, &project.src("a.ts"), "node"));
    for name in ["b", "c"] {
        assert!(!is_member(&filer, &project.src(&format!("{name}.ts")), "node"));
        assert!(!project.out("node", &format!("{name}.js")).exists());
        assert!(filer.build_file(project.out("node", &format!("{name}.js"))).is_none());
    }
    assert!(project.out("node", "a.js").is_file());

    // Both files are still tracked, they just aren't built anymore.
    let b = filer.source_file(project.src("b.ts")).unwrap();
    assert!(b.dependents.is_empty());
    assert!(b.build_files.is_empty());

    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shared_dependency_stays_while_imported() {
    let project = Project::new(&[
        ("a.ts", "import c\n"),
        ("b.ts", "import c\n"),
        ("c.ts", "export const c = 1;\n"),
    ]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts"), ("node", "b.ts")]);
    filer.init().await.unwrap();
    assert_eq!(builder.calls(&project.src("c.ts"), "node"), 1);

    project.write("a.ts", "export const a = 1;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();

    let c = filer.source_file(project.src("c.ts")).unwrap();
    assert!(c.build_configs.contains("node"));
    assert_eq!(c.dependents["node"].len(), 1);
    assert!(c.dependents["node"].contains_key(&project.src("b.ts")));
    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_import_cycle() {
    let project = Project::new(&[
        ("a.ts", "import b\n"),
        ("b.ts", "import c\n"),
        ("c.ts", "import b\n"),
    ]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    assert!(is_member(&filer, &project.src("c.ts"), "node"));
    assert_mirrored(&filer);

    // The cycle keeps itself alive once its importer is gone.
    project.write("a.ts", "export const a = 1;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();
    assert!(is_member(&filer, &project.src("b.ts"), "node"));
    assert!(is_member(&filer, &project.src("c.ts"), "node"));
    assert_mirrored(&filer);

    // Deleting one side takes the other one with it, without coming back
    // around to the deleted file.
    std::fs::remove_file(project.src("b.ts")).unwrap();
    filer.on_dir_change(change(DirChangeKind::Delete, "b.ts"), DirId(0)).await.unwrap();
    assert!(filer.source_file(project.src("b.ts")).is_none());
    assert!(!is_member(&filer, &project.src("c.ts"), "node"));
    assert!(!project.out("node", "c.js").exists());
    assert!(is_member(&filer, &project.src("a.ts"), "node"));
    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_file_leaves_every_build() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts"), ("browser", "a.ts")]);
    filer.init().await.unwrap();

    let id = project.src("a.ts");
    let meta = filer.paths().to_source_meta_path(&id);
    assert!(meta.is_file());
    for config in ["node", "browser"] {
        assert!(project.out(config, "a.js").is_file());
    }

    std::fs::remove_file(&id).unwrap();
    filer.on_dir_change(change(DirChangeKind::Delete, "a.ts"), DirId(0)).await.unwrap();

    assert!(filer.source_file(&id).is_none());
    assert!(!meta.exists());
    for config in ["node", "browser"] {
        assert!(filer.build_file(project.out(config, "a.js")).is_none());
        assert!(!project.out(config, "a.js").exists());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recreated_dependency_rejoins() {
    let project = Project::new(&[("a.ts", "import b\n"), ("b.ts", "export const b = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts"), ("browser", "a.ts")]);
    filer.init().await.unwrap();

    let b = project.src("b.ts");
    std::fs::remove_file(&b).unwrap();
    filer.on_dir_change(change(DirChangeKind::Delete, "b.ts"), DirId(0)).await.unwrap();
    assert!(filer.source_file(&b).is_none());
    assert!(!project.out("node", "b.js").exists());

    // The importer kept its edge, so the file comes back in both configs.
    project.write("b.ts", "export const b = 2;\n");
    filer.on_dir_change(change(DirChangeKind::Create, "b.ts"), DirId(0)).await.unwrap();

    for config in ["node", "browser"] {
        assert!(is_member(&filer, &b, config));
        assert_eq!(builder.calls(&b, config), 2);
        let out = std::fs::read_to_string(project.out(config, "b.js")).unwrap();
        assert_eq!(out, "export const b = 2;\n");
    }
    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_skips_compiles() {
    let project = Project::new(&[("a.ts", "import b\n"), ("b.ts", "export const b = 1;\n")]);

    let first = ImportBuilder::default();
    let filer = project.filer(&first, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    filer.close();
    assert_eq!(first.total(), 2);
    drop(filer);

    let second = ImportBuilder::default();
    let filer = project.filer(&second, &[("node", "a.ts")]);
    filer.init().await.unwrap();

    assert_eq!(second.total(), 0);
    assert!(is_member(&filer, &project.src("b.ts"), "node"));
    assert!(filer.build_file(project.out("node", "b.js")).is_some());
    assert_mirrored(&filer);

    // A file changed while nobody was watching is compiled again.
    filer.close();
    drop(filer);
    project.write("b.ts", "export const b = 2;\n");

    let third = ImportBuilder::default();
    let filer = project.filer(&third, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    assert_eq!(third.calls(&project.src("a.ts"), "node"), 0);
    assert_eq!(third.calls(&project.src("b.ts"), "node"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_keeps_builds_not_yet_joined() {
    let project = Project::new(&[("x.ts", "import b\n"), ("b.ts", "export const b = 1;\n")]);

    let first = ImportBuilder::default();
    let filer = project.filer(&first, &[("node", "x.ts")]);
    filer.init().await.unwrap();
    filer.close();
    drop(filer);

    // `b.ts` compiles for browser while its cached node build is still
    // waiting for `x.ts` to pull it in.
    project.write("x.ts", "import b\nexport const x = 2;\n");
    let second = ImportBuilder::slow_for("node", Duration::from_millis(100));
    let filer = project.filer(&second, &[("node", "x.ts"), ("browser", "b.ts")]);
    filer.init().await.unwrap();
    assert_eq!(second.calls(&project.src("b.ts"), "browser"), 1);
    assert_eq!(second.calls(&project.src("b.ts"), "node"), 0);
    assert_eq!(second.calls(&project.src("x.ts"), "node"), 1);
    filer.close();
    drop(filer);

    let third = ImportBuilder::default();
    let filer = project.filer(&third, &[("node", "x.ts"), ("browser", "b.ts")]);
    filer.init().await.unwrap();
    assert_eq!(third.total(), 0);
    for config in ["node", "browser"] {
        assert!(is_member(&filer, &project.src("b.ts"), config));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_build_keeps_last_artifacts() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();

    project.write("a.ts", "export const a = !error;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();

    assert_eq!(builder.calls(&project.src("a.ts"), "node"), 2);
    assert!(is_member(&filer, &project.src("a.ts"), "node"));
    let out = filer.build_file(project.out("node", "a.js")).unwrap();
    assert_eq!(out.content.as_str(), Some("export const a = 1;\n"));
    assert_eq!(
        std::fs::read_to_string(project.out("node", "a.js")).unwrap(),
        "export const a = 1;\n"
    );

    project.write("a.ts", "export const a = 2;\n");
    filer.on_dir_change(change(DirChangeKind::Update, "a.ts"), DirId(0)).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(project.out("node", "a.js")).unwrap(),
        "export const a = 2;\n"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_on_remove_is_not_fatal() {
    let project = Project::new(&[("a.ts", "import b\n"), ("b.ts", "export const b = 1;\n")]);
    let builder = ImportBuilder::failing_removes();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();

    let b = project.src("b.ts");
    std::fs::remove_file(&b).unwrap();
    filer.on_dir_change(change(DirChangeKind::Delete, "b.ts"), DirId(0)).await.unwrap();

    assert_eq!(builder.removes(), 1);
    assert!(filer.source_file(&b).is_none());
    assert!(!project.out("node", "b.js").exists());
    assert!(!filer.paths().to_source_meta_path(&b).exists());
    assert_mirrored(&filer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_glob_inputs() {
    let project = Project::new(&[
        ("home.page.ts", "import util\n"),
        ("about.page.ts", "export const about = 1;\n"),
        ("util.ts", "export const util = 1;\n"),
        ("unused.ts", "export const unused = 1;\n"),
    ]);
    let builder = ImportBuilder::default();
    let pages = BuildConfigInput::glob(&format!("{}/*.page.ts", project.root.join("src"))).unwrap();
    let filer = FilerOptions::new(&project.root)
        .source_dir("src")
        .builder(builder.clone())
        .build_config(BuildConfig::new("browser", Platform::Browser).with_input(pages))
        .build()
        .unwrap();
    filer.init().await.unwrap();

    for name in ["home.page.ts", "about.page.ts"] {
        let file = filer.source_file(project.src(name)).unwrap();
        assert!(file.is_input_to("browser"), "{name} should be an input");
    }
    let util = filer.source_file(project.src("util.ts")).unwrap();
    assert!(util.build_configs.contains("browser"));
    assert!(!util.is_input_to("browser"));
    assert!(!is_member(&filer, &project.src("unused.ts"), "browser"));

    // A new file matching the pattern joins as an input on its own.
    project.write("contact.page.ts", "export const contact = 1;\n");
    filer.on_dir_change(change(DirChangeKind::Create, "contact.page.ts"), DirId(0)).await.unwrap();

    let contact = filer.source_file(project.src("contact.page.ts")).unwrap();
    assert!(contact.is_input_to("browser"));
    assert_eq!(builder.calls(&project.src("contact.page.ts"), "browser"), 1);
    assert!(project.out("browser", "contact.page.js").is_file());

    // One that doesn't is only tracked.
    project.write("other.ts", "export const other = 1;\n");
    filer.on_dir_change(change(DirChangeKind::Create, "other.ts"), DirId(0)).await.unwrap();
    assert!(!is_member(&filer, &project.src("other.ts"), "browser"));
    assert!(filer.source_file(project.src("other.ts")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_input() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "missing.ts")]);

    match filer.init().await {
        Err(FilerError::Shared(err)) => {
            assert!(matches!(&*err, FilerError::MissingInput(name, _) if name == "node"));
        }
        other => panic!("expected a missing input, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_init_runs_once() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let builder = ImportBuilder::slow(Duration::from_millis(20));
    let filer = project.filer(&builder, &[("node", "a.ts")]);

    let (a, b) = tokio::join!(filer.init(), filer.init());
    a.unwrap();
    b.unwrap();
    filer.init().await.unwrap();

    assert_eq!(builder.calls(&project.src("a.ts"), "node"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_events() {
    let project = Project::new(&[("a.ts", "import b\n"), ("b.ts", "export const b = 1;\n")]);
    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    let mut events = filer.subscribe();
    filer.init().await.unwrap();

    let mut built = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.build_config, "node");
        built.push(event.source_id);
    }
    built.sort();
    assert_eq!(built, vec![project.src("a.ts"), project.src("b.ts")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_output_dirs() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    let stale = project.out("node", "stale.js");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "old").unwrap();

    let builder = ImportBuilder::default();
    let filer = FilerOptions::new(&project.root)
        .source_dir("src")
        .builder(builder.clone())
        .build_config(BuildConfig::new("node", Platform::Node).with_input(BuildConfigInput::path(project.src("a.ts"))))
        .clean_output_dirs(true)
        .build()
        .unwrap();
    filer.init().await.unwrap();

    assert!(!stale.exists());
    assert!(project.out("node", "a.js").is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_served_dirs() {
    let project = Project::new(&[("a.ts", "export const a = 1;\n")]);
    std::fs::create_dir_all(project.root.join("static/img")).unwrap();
    std::fs::write(project.root.join("static/index.html"), "<html></html>").unwrap();
    std::fs::write(project.root.join("static/img/dot.png"), [0x89, 0x50, 0x4e, 0x47, 0xff]).unwrap();

    let builder = ImportBuilder::default();
    let filer = FilerOptions::new(&project.root)
        .source_dir("src")
        .served_dir("static")
        .builder(builder.clone())
        .build_config(BuildConfig::new("node", Platform::Node).with_input(BuildConfigInput::path(project.src("a.ts"))))
        .build()
        .unwrap();
    filer.init().await.unwrap();

    let index = filer.find_by_path("index.html").unwrap();
    assert!(!index.buildable);
    assert!(index.build_configs.is_empty());
    assert_eq!(index.content.as_str(), Some("<html></html>"));

    let png = filer.find_by_path("img/dot.png").unwrap();
    assert_eq!(png.content.as_bytes(), &[0x89, 0x50, 0x4e, 0x47, 0xff]);

    // Sources aren't served.
    assert!(filer.find_by_path("a.ts").is_none());
    assert_eq!(builder.total(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_dir_removes_outputs() {
    let project = Project::new(&[("a.ts", "import lib/b\n")]);
    std::fs::create_dir_all(project.src("lib")).unwrap();
    project.write("lib/b.ts", "export const b = 1;\n");

    let builder = ImportBuilder::default();
    let filer = project.filer(&builder, &[("node", "a.ts")]);
    filer.init().await.unwrap();
    assert!(project.out("node", "lib/b.js").is_file());

    let dir = DirChange {
        kind: DirChangeKind::Delete,
        path: "lib".into(),
        stats: PathStats {
            is_directory: true,
            size: 0,
            modified: None,
        },
    };
    filer.on_dir_change(dir, DirId(0)).await.unwrap();

    assert!(!project.out("node", "lib").exists());
    assert!(project.out("node", "a.js").is_file());
}
