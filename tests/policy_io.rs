#[cfg(feature = "policy-io")]
mod policy_io {
    use safefs::policy::AccessMode;
    use safefs::policy_io::{PolicyFormat, load_policy, load_policy_limited, parse_policy};

    const TOML_POLICY: &str = r#"
[[allow]]
pattern = "~/.bashrc"
mode = "read_write"

[[allow]]
pattern = ".config/nvim/**"

[limits]
max_read_bytes = 65536

[retention]
keep_all_days = 3
daily_until_days = 14
max_age_days = 60
thin_in_background = false

[blocks]
tag = "assistant"
comment = "//"
"#;

    #[test]
    fn load_policy_toml_and_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let toml_path = dir.path().join("safefs.toml");
        let json_path = dir.path().join("safefs.json");
        std::fs::write(&toml_path, TOML_POLICY).expect("write toml");

        let policy = load_policy(&toml_path).expect("load toml");
        assert_eq!(policy.allow.len(), 2);
        assert_eq!(policy.allow[0].mode, AccessMode::ReadWrite);
        assert_eq!(policy.allow[1].mode, AccessMode::Read);
        assert_eq!(policy.limits.max_read_bytes, 65536);
        assert_eq!(policy.limits.effective_max_patch_bytes(), 65536);
        assert_eq!(policy.retention.keep_all_days, 3);
        assert!(!policy.retention.thin_in_background);
        assert_eq!(policy.blocks.tag, "assistant");

        std::fs::write(&json_path, serde_json::to_string(&policy).expect("json")).expect("write");
        let from_json = load_policy(&json_path).expect("load json");
        assert_eq!(from_json.allow, policy.allow);
        assert_eq!(from_json.retention.max_age_days, 60);
    }

    #[test]
    fn unknown_fields_and_bad_retention_are_rejected() {
        let err = parse_policy("[limits]\nmax_bytes = 1\n", PolicyFormat::Toml)
            .expect_err("unknown field");
        assert_eq!(err.code(), safefs::Error::CODE_INVALID_POLICY);

        let err = parse_policy(
            "[retention]\nkeep_all_days = 40\ndaily_until_days = 30\n",
            PolicyFormat::Toml,
        )
        .expect_err("unordered retention");
        match err {
            safefs::Error::InvalidPolicy(message) => assert!(
                message.contains("keep_all_days <= daily_until_days"),
                "unexpected message: {message}"
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn oversized_and_unsupported_files_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("safefs.toml");
        std::fs::write(&path, TOML_POLICY).expect("write");

        let err = load_policy_limited(&path, 16).expect_err("too large");
        match err {
            safefs::Error::TooLarge { max_bytes, .. } => assert_eq!(max_bytes, 16),
            other => panic!("unexpected error: {other:?}"),
        }

        let yaml = dir.path().join("safefs.yaml");
        std::fs::write(&yaml, "allow: []\n").expect("write");
        let err = load_policy(&yaml).expect_err("yaml");
        assert_eq!(err.code(), safefs::Error::CODE_INVALID_POLICY);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_policy_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real.toml");
        let link = dir.path().join("safefs.toml");
        std::fs::write(&real, TOML_POLICY).expect("write");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let err = load_policy(&link).expect_err("symlink");
        assert_eq!(err.code(), safefs::Error::CODE_INVALID_PATH);
    }
}
