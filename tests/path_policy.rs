mod common;

use std::path::Path;

use common::Home;
use safefs::{AccessMode, AllowRule, DenyReason, GrantSource, PathDecision, PathPolicy, Session};

fn policy(rules: &[(&str, AccessMode)]) -> PathPolicy {
    let rules: Vec<AllowRule> = rules
        .iter()
        .map(|(pattern, mode)| AllowRule::new(*pattern, *mode))
        .collect();
    PathPolicy::new(&rules).expect("path policy")
}

fn denied_reason(decision: PathDecision) -> DenyReason {
    match decision {
        PathDecision::Denied { reason, .. } => reason,
        other => panic!("expected denial, got {other:?}"),
    }
}

#[test]
fn outside_home_is_denied_even_with_allow_everything() {
    let home = Home::new();
    let outside = home.outside();
    std::fs::write(outside.join("notes.txt"), "x").expect("write");
    let policy = policy(&[("**", AccessMode::ReadWrite)]);

    for path in [
        outside.join("notes.txt"),
        outside.join("new.txt"),
        home.home.join("..").join("..").join("outside").join("notes.txt"),
    ] {
        let decision = policy.evaluate(&path, &home.session());
        assert_eq!(denied_reason(decision), DenyReason::OutsideHome, "{}", path.display());
    }
}

#[cfg(unix)]
#[test]
fn symlink_out_of_home_is_symlink_escape() {
    let home = Home::new();
    let outside = home.outside();
    std::fs::write(outside.join("secret"), "s").expect("write");
    std::fs::create_dir_all(&home.home).expect("mkdir home");
    std::os::unix::fs::symlink(outside.join("secret"), home.path("looks-local")).expect("symlink");
    std::os::unix::fs::symlink(&outside, home.path("linked-dir")).expect("symlink dir");
    let policy = policy(&[("**", AccessMode::ReadWrite)]);

    let decision = policy.evaluate(&home.path("looks-local"), &home.session());
    assert_eq!(denied_reason(decision), DenyReason::SymlinkEscape);

    let decision = policy.evaluate(&home.path("linked-dir/new-file"), &home.session());
    assert_eq!(denied_reason(decision), DenyReason::SymlinkEscape);
}

#[cfg(unix)]
#[test]
fn dangling_symlink_pointing_outside_is_symlink_escape() {
    let home = Home::new();
    let outside = home.outside();
    std::os::unix::fs::symlink(outside.join("missing"), home.path("dangling")).expect("symlink");
    let policy = policy(&[("**", AccessMode::ReadWrite)]);

    let decision = policy.evaluate(&home.path("dangling"), &home.session());
    assert_eq!(denied_reason(decision), DenyReason::SymlinkEscape);
}

#[cfg(unix)]
#[test]
fn in_home_symlink_resolves_to_its_target() {
    let home = Home::new();
    let target = home.write("dotfiles/bashrc", "export A=1\n");
    std::os::unix::fs::symlink(&target, home.path(".bashrc")).expect("symlink");
    let policy = policy(&[("dotfiles/*", AccessMode::ReadWrite)]);

    match policy.evaluate(&home.path(".bashrc"), &home.session()) {
        PathDecision::Allowed { canonical, .. } => assert_eq!(canonical, target),
        other => panic!("unexpected decision: {other:?}"),
    }
}

#[test]
fn allowlist_modes_are_enforced() {
    let home = Home::new();
    home.write(".bashrc", "");
    home.write(".config/nvim/init.lua", "");
    let policy = policy(&[
        (".bashrc", AccessMode::ReadWrite),
        ("~/.config/**", AccessMode::Read),
    ]);
    let session = home.session();

    let bashrc = policy.evaluate(&home.path(".bashrc"), &session);
    assert!(bashrc.permits(AccessMode::Write));
    match bashrc {
        PathDecision::Allowed { source, .. } => assert_eq!(
            source,
            GrantSource::AllowRule {
                index: 0,
                pattern: ".bashrc".to_string()
            }
        ),
        other => panic!("unexpected decision: {other:?}"),
    }

    let init = policy.evaluate(&home.path(".config/nvim/init.lua"), &session);
    assert!(init.permits(AccessMode::Read));
    assert!(!init.permits(AccessMode::Write));
    assert_eq!(
        init.require(AccessMode::Write).deny_reason(),
        Some(DenyReason::NotAllowlisted)
    );

    let profile = policy.evaluate(&home.path(".profile"), &session);
    assert_eq!(denied_reason(profile), DenyReason::NotAllowlisted);
}

#[test]
fn single_star_does_not_cross_directories() {
    let home = Home::new();
    home.write(".config/a.toml", "");
    home.write(".config/nested/b.toml", "");
    let policy = policy(&[(".config/*", AccessMode::ReadWrite)]);

    assert!(policy.evaluate(&home.path(".config/a.toml"), &home.session()).is_allowed());
    assert!(!policy
        .evaluate(&home.path(".config/nested/b.toml"), &home.session())
        .is_allowed());
}

#[test]
fn project_root_grants_session_mode() {
    let home = Home::new();
    let file = home.project.join("main.rs");
    std::fs::write(&file, "fn main() {}\n").expect("write");
    let policy = policy(&[]);

    match policy.evaluate(&file, &home.session()) {
        PathDecision::Allowed { mode, source, .. } => {
            assert_eq!(mode, AccessMode::ReadWrite);
            assert!(matches!(source, GrantSource::Project { .. }));
        }
        other => panic!("unexpected decision: {other:?}"),
    }

    let read_only = Session::with_project_root(
        home.identity(),
        &home.project,
        &home.project,
        AccessMode::Read,
    );
    let decision = policy.evaluate(&file, &read_only);
    assert!(decision.permits(AccessMode::Read));
    assert!(!decision.permits(AccessMode::Write));
}

#[test]
fn relative_and_tilde_paths_resolve_against_session() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "");
    std::fs::write(home.project.join("Cargo.toml"), "").expect("write");
    let policy = policy(&[(".bashrc", AccessMode::ReadWrite)]);
    let session = home.session();

    match policy.evaluate(Path::new("~/.bashrc"), &session) {
        PathDecision::Allowed { canonical, .. } => assert_eq!(canonical, bashrc),
        other => panic!("unexpected decision: {other:?}"),
    }
    match policy.evaluate(Path::new("Cargo.toml"), &session) {
        PathDecision::Allowed { canonical, .. } => {
            assert_eq!(canonical, home.project.join("Cargo.toml"))
        }
        other => panic!("unexpected decision: {other:?}"),
    }
}

#[test]
fn new_files_need_an_existing_parent() {
    let home = Home::new();
    let policy = policy(&[("**", AccessMode::ReadWrite)]);
    std::fs::create_dir_all(&home.home).expect("mkdir");

    assert!(policy.evaluate(&home.path("fresh.txt"), &home.session()).is_allowed());
    let decision = policy.evaluate(&home.path("missing/dir/fresh.txt"), &home.session());
    assert_eq!(denied_reason(decision), DenyReason::InvalidPath);
    let decision = policy.evaluate(Path::new(""), &home.session());
    assert_eq!(denied_reason(decision), DenyReason::InvalidPath);
}

#[test]
fn invalid_rules_are_rejected() {
    for pattern in ["/etc/passwd", "../outside", "a/../../b"] {
        let policy = safefs::SafeFsPolicy::with_rules(vec![AllowRule::new(
            pattern,
            AccessMode::Read,
        )]);
        let err = policy.validate().expect_err("should reject");
        assert_eq!(err.code(), safefs::Error::CODE_INVALID_POLICY, "{pattern}");
    }
}
