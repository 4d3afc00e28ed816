mod common;

use std::collections::HashSet;

use chrono::{Datelike, Duration, TimeZone, Utc};
use common::{Home, file_names};
use safefs::{BackupOutcome, BackupReason, BackupStore, RetentionPolicy};

#[test]
fn hundred_days_of_daily_backups_thin_to_the_retention_bands() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "export A=1\n");
    let store = BackupStore::new(&home.backups, RetentionPolicy::default());
    let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).single().expect("now");

    for age in (0..100).rev() {
        let outcome = store
            .backup_at(&bashrc, BackupReason::PreWrite, now - Duration::days(age))
            .expect("backup");
        assert!(matches!(outcome, BackupOutcome::Created(_)));
    }
    assert_eq!(store.list(&bashrc).expect("list").len(), 100);

    let removed = store.thin_at(&bashrc, now).expect("thin");
    let kept = store.list(&bashrc).expect("list");
    assert_eq!(removed.len() + kept.len(), 100);

    let ages: Vec<i64> = kept
        .iter()
        .map(|backup| (now - backup.created_at).num_days())
        .collect();
    for age in 0..7 {
        assert!(ages.contains(&age), "backup aged {age} days must survive");
    }
    for age in 7..=30 {
        assert!(ages.contains(&age), "daily backup aged {age} days must survive");
    }
    assert!(ages.iter().all(|age| *age <= 90), "nothing older than 90 days");

    let mut days = HashSet::new();
    let mut weeks = HashSet::new();
    for backup in &kept {
        let age = (now - backup.created_at).num_days();
        if age >= 7 {
            assert!(days.insert(backup.created_at.date_naive()), "one per day");
        }
        if age > 30 {
            let week = backup.created_at.iso_week();
            assert!(weeks.insert((week.year(), week.week())), "one per ISO week");
        }
    }
    assert!(
        !weeks.is_empty() && weeks.len() <= 10,
        "weekly band keeps a handful: {}",
        weeks.len()
    );

    // Thinning is idempotent.
    assert!(store.thin_at(&bashrc, now).expect("thin again").is_empty());
}

#[test]
fn thinning_removes_sidecars_and_leaves_other_paths_alone() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "a\n");
    let zshrc = home.write(".zshrc", "z\n");
    let store = BackupStore::new(&home.backups, RetentionPolicy::default());
    let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().expect("now");
    let old = now - Duration::days(120);

    store
        .backup_at(&bashrc, BackupReason::PreWrite, old)
        .expect("old bashrc");
    store
        .backup_at(&zshrc, BackupReason::PreWrite, old)
        .expect("old zshrc");

    let removed = store.thin_at(&bashrc, now).expect("thin");
    assert_eq!(removed.len(), 1);
    let bashrc_dir = removed[0].path.parent().expect("parent").to_path_buf();
    assert!(file_names(&bashrc_dir).is_empty(), "sidecar removed too");
    assert_eq!(store.list(&zshrc).expect("list").len(), 1);
}

#[cfg(unix)]
#[test]
fn backups_mirror_the_original_path_and_carry_metadata() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "export A=1\n");
    let store = BackupStore::new(&home.backups, RetentionPolicy::default());
    let at = Utc
        .with_ymd_and_hms(2026, 10, 18, 10, 15, 0)
        .single()
        .expect("at");

    let backup = match store
        .backup_at(&bashrc, BackupReason::PrePatch, at)
        .expect("backup")
    {
        BackupOutcome::Created(backup) => backup,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let relative = bashrc.strip_prefix("/").expect("absolute");
    assert_eq!(backup.path.parent(), Some(home.backups.join(relative).as_path()));
    assert_eq!(
        backup.file_name(),
        Some("20261018T101500.000000Z-000001.bak")
    );
    assert_eq!(
        file_names(&home.backups.join(relative)),
        vec![
            "20261018T101500.000000Z-000001.bak".to_string(),
            "20261018T101500.000000Z-000001.bak.meta.json".to_string(),
        ]
    );

    let listed = store.list(&bashrc).expect("list");
    assert_eq!(listed, vec![backup.clone()]);
    assert_eq!(listed[0].reason, Some(BackupReason::PrePatch));
    assert_eq!(listed[0].size_bytes, 11);

    let second = store
        .backup_at(&bashrc, BackupReason::PreWrite, at)
        .expect("second");
    assert_eq!(second.backup().map(|backup| backup.sequence), Some(2));
    assert_eq!(
        store
            .find(&bashrc, "20261018T101500.000000Z-000002.bak")
            .expect("find")
            .reason,
        Some(BackupReason::PreWrite)
    );
}

#[test]
fn missing_original_has_no_prior_content() {
    let home = Home::new();
    let store = BackupStore::new(&home.backups, RetentionPolicy::default());

    let outcome = store
        .backup(&home.path(".missing"), BackupReason::PreWrite)
        .expect("backup");
    assert_eq!(outcome, BackupOutcome::NoPriorContent);
    assert!(!home.backups.exists());
}

#[test]
fn safefs_thinning_is_read_gated_and_keeps_fresh_backups() {
    let home = Home::new();
    let bashrc = home.write(".bashrc", "a\n");
    let zshrc = home.write(".zshrc", "z\n");
    let (safefs, _audit) = home.safefs(&common::bashrc_rules());
    let session = home.session();

    safefs
        .write(&session, &bashrc, "b\n", safefs::WriteOptions::confirmed())
        .expect("write")
        .into_applied()
        .expect("applied");
    assert!(
        safefs
            .thin_backups(&session, &bashrc)
            .expect("thin")
            .is_empty()
    );
    assert_eq!(safefs.backups(&session, &bashrc).expect("list").len(), 1);

    let err = safefs
        .thin_backups(&session, &zshrc)
        .expect_err("not allowlisted");
    assert_eq!(err.code(), safefs::Error::CODE_PATH_DENIED);
}
