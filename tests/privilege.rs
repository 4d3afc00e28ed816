mod common;

use common::Home;
use safefs::{
    AccessMode, GateDecision, PatchRequest, PrivilegeDenial, PrivilegeGate, ReadResult, Rejection,
    Session, WriteOptions, WriteResult,
};

fn root_session(home: &Home) -> Session {
    Session::with_project_root(
        home.root_identity(),
        &home.project,
        &home.project,
        AccessMode::ReadWrite,
    )
}

fn assert_root_read_only(result: WriteResult) {
    match result {
        WriteResult::Rejected(Rejection::PrivilegeDenied { reason }) => {
            assert_eq!(reason, PrivilegeDenial::RootReadOnly)
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn gate_only_blocks_writes_for_root() {
    let home = Home::new();
    let root = home.root_identity();
    let user = home.identity();

    assert_eq!(
        PrivilegeGate::check(&root, AccessMode::Write),
        GateDecision::Denied(PrivilegeDenial::RootReadOnly)
    );
    assert_eq!(
        PrivilegeGate::check(&root, AccessMode::ReadWrite),
        GateDecision::Denied(PrivilegeDenial::RootReadOnly)
    );
    assert!(PrivilegeGate::check(&root, AccessMode::Read).is_allowed());
    assert!(PrivilegeGate::check(&user, AccessMode::Write).is_allowed());
}

#[test]
fn root_cannot_mutate_even_fully_allowed_paths() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "export A=1\n");
    let (safefs, audit) = home.safefs(&[("**", AccessMode::ReadWrite)]);
    let session = root_session(&home);

    assert_root_read_only(
        safefs
            .write(&session, &bashrc, "export A=2\n", WriteOptions::confirmed())
            .expect("write"),
    );
    assert_root_read_only(
        safefs
            .apply_patch(
                &session,
                &bashrc,
                &PatchRequest::full_replace("x\n"),
                WriteOptions::confirmed().with_scope_override(),
            )
            .expect("patch"),
    );
    assert_root_read_only(
        safefs
            .upsert_block(&session, &bashrc, "a", "x\n", WriteOptions::confirmed())
            .expect("upsert"),
    );
    assert_root_read_only(
        safefs
            .write(&session, &home.path("fresh"), "x", WriteOptions::confirmed())
            .expect("create"),
    );

    assert_eq!(home.read(".bashrc"), "export A=1\n");
    assert!(!home.path("fresh").exists());
    assert!(
        !home.backups.exists(),
        "root must never reach backup allocation"
    );
    let records = audit.records();
    assert_eq!(records.len(), 4);
    assert!(
        records
            .iter()
            .all(|record| record.outcome == safefs::AuditOutcome::Denied && record.uid == 0)
    );
}

#[test]
fn root_can_still_read() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "export A=1\n");
    let (safefs, _audit) = home.safefs(&[(".bashrc", AccessMode::Read)]);

    let result = safefs
        .read(&root_session(&home), &bashrc, 1024)
        .expect("read");
    match result {
        ReadResult::Content(content) => assert_eq!(content.content, "export A=1\n"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn root_propose_is_rejected() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "a\n");
    let (safefs, _audit) = home.safefs(&[(".bashrc", AccessMode::ReadWrite)]);

    let result = safefs
        .propose_patch(&root_session(&home), &bashrc, &PatchRequest::full_replace("b\n"))
        .expect("propose");
    assert!(matches!(
        result,
        safefs::ProposeResult::Rejected(Rejection::PrivilegeDenied { .. })
    ));
}
