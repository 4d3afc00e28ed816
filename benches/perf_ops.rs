use std::fs;
use std::path::{Path, PathBuf};

use criterion::{Criterion, criterion_group, criterion_main};
use safefs::policy::BlockSettings;
use safefs::{
    AccessMode, AllowRule, Identity, Limits, ManagedBlockEditor, PatchEngine, PatchRequest,
    SafeFs, SafeFsPolicy, Session, WriteOptions,
};

struct BenchFixture {
    _tempdir: tempfile::TempDir,
    home: PathBuf,
    session: Session,
    safefs: SafeFs,
    large: String,
    large_patch: PatchRequest,
    managed: String,
    managed_patch: PatchRequest,
    scratch: PathBuf,
}

fn managed_content(editor: &ManagedBlockEditor, blocks: usize) -> String {
    let mut content = String::from("# user settings\nexport EDITOR=vim\n");
    for i in 0..blocks {
        content = editor
            .upsert_block(&content, &format!("block-{i}"), &format!("export B{i}=1\n"))
            .expect("upsert block");
        content.push_str(&format!("alias l{i}='ls -l'\n"));
    }
    content
}

fn setup_fixture() -> BenchFixture {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let root = tempdir.path().canonicalize().expect("canonicalize");
    let home = root.join("home").join("bench");
    let project = home.join("src").join("proj");
    fs::create_dir_all(project.join(".git")).expect("mkdir project");
    fs::create_dir_all(home.join(".config").join("nvim")).expect("mkdir config");

    let mut large = String::with_capacity(256 * 1024);
    for i in 0..8_000 {
        large.push_str(&format!("line-{i} export VALUE_{i}=plain\n"));
    }
    let modified = large
        .replace("line-10 export", "line-10 changed")
        .replace("line-4000 export", "line-4000 changed")
        .replace("line-7990 export", "line-7990 changed");
    let large_patch = PatchRequest::parse_diff(&diffy::create_patch(&large, &modified).to_string())
        .expect("parse large patch");

    let editor = ManagedBlockEditor::new(&BlockSettings::default());
    let managed = managed_content(&editor, 64);
    let managed_modified = managed.replace("export B32=1\n", "export B32=2\n");
    let managed_patch =
        PatchRequest::parse_diff(&diffy::create_patch(&managed, &managed_modified).to_string())
            .expect("parse managed patch");

    let mut policy = SafeFsPolicy::with_rules(vec![
        AllowRule::new(".bashrc", AccessMode::ReadWrite),
        AllowRule::new(".config/**", AccessMode::ReadWrite),
        AllowRule::new(".local/share/*.log", AccessMode::Read),
    ]);
    policy.backups.dir = Some(root.join("backups"));
    policy.retention.thin_in_background = false;
    let safefs = SafeFs::new(policy).expect("safefs");

    let session = Session::with_project_root(
        Identity::new(1000, "bench", &home),
        &project,
        &project,
        AccessMode::ReadWrite,
    );
    let scratch = home.join(".config").join("nvim").join("init.lua");
    fs::write(&scratch, "-- init\n").expect("write scratch");

    BenchFixture {
        _tempdir: tempdir,
        home,
        session,
        safefs,
        large,
        large_patch,
        managed,
        managed_patch,
        scratch,
    }
}

fn candidate_paths(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join(".bashrc"),
        home.join(".config").join("nvim").join("init.lua"),
        home.join(".ssh").join("id_ed25519"),
        home.join("src").join("proj").join("Cargo.toml"),
        PathBuf::from("/etc/passwd"),
    ]
}

fn bench_ops(c: &mut Criterion) {
    let fixture = setup_fixture();
    let engine = PatchEngine::new(&Limits::default());
    let editor = ManagedBlockEditor::new(&BlockSettings::default());
    let target = Path::new("/home/bench/large.txt");

    c.bench_function("patch/apply_three_hunks_large_file", |b| {
        b.iter(|| {
            engine
                .apply(target, &fixture.large, &fixture.large_patch)
                .expect("apply");
        });
    });

    c.bench_function("patch/preview_large_file", |b| {
        let updated = engine
            .apply(target, &fixture.large, &fixture.large_patch)
            .expect("apply");
        b.iter(|| PatchEngine::preview(&fixture.large, &updated));
    });

    c.bench_function("blocks/validate_scope_64_blocks", |b| {
        b.iter(|| {
            let decision = editor.validate_patch_scope(&fixture.managed, &fixture.managed_patch);
            assert!(decision.is_allowed());
        });
    });

    c.bench_function("path_policy/evaluate_mixed_paths", |b| {
        let paths = candidate_paths(&fixture.home);
        b.iter(|| {
            for path in &paths {
                fixture.safefs.evaluate(&fixture.session, path);
            }
        });
    });

    c.bench_function("safefs/write_with_backup", |b| {
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            fixture
                .safefs
                .write(
                    &fixture.session,
                    &fixture.scratch,
                    &format!("-- init {round}\n"),
                    WriteOptions::confirmed(),
                )
                .expect("write");
        });
    });
}

criterion_group!(benches, bench_ops);
criterion_main!(benches);
