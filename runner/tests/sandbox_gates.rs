//! Sandbox gate tests against a real challenge directory.
//!
//! Every refusal must happen before anything is read or spawned; everything
//! that does run stays inside the scratch area.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use ctf_runner::core::action::{Action, ExecOptions};
use ctf_runner::core::policy::Policy;
use ctf_runner::core::types::BlockReason;
use ctf_runner::io::host::HostEnv;
use ctf_runner::io::sandbox::{ActionRunner, SandboxRunner};
use ctf_runner::test_support::{ChallengeFixture, test_policy};

fn runner(fixture: &ChallengeFixture, policy: Policy) -> SandboxRunner {
    SandboxRunner::new(&fixture.challenge_dir(), &fixture.work_dir(), policy).expect("runner")
}

fn command(tokens: &[&str]) -> Action {
    Action::RunCommand {
        command: tokens.iter().map(|s| s.to_string()).collect(),
        target: None,
        options: ExecOptions::default(),
    }
}

fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).expect("create archive");
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, *data)
            .expect("append entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

#[test]
fn path_escape_is_blocked_before_reading() {
    let fixture = ChallengeFixture::new().expect("fixture");
    fs::write(fixture.root().join("secret.txt"), "flag{outside}").expect("write secret");
    let runner = runner(&fixture, Policy::default());

    for target in ["../secret.txt", "/etc/passwd", "a/../../secret.txt"] {
        let result = runner.run(&Action::ReadFileHead {
            target: target.to_string(),
        });
        assert!(!result.succeeded, "{target}");
        assert!(
            matches!(result.blocked, Some(BlockReason::PathEscapeBlocked { .. })),
            "{target}"
        );
        assert!(result.stdout.is_empty());
        assert!(result.detected_flag.is_none());
    }
}

#[cfg(unix)]
#[test]
fn symlink_escape_is_blocked() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let secret = fixture.root().join("secret.txt");
    fs::write(&secret, "flag{outside}").expect("write secret");
    std::os::unix::fs::symlink(&secret, fixture.challenge_dir().join("innocent.txt"))
        .expect("symlink");
    let runner = runner(&fixture, Policy::default());

    let result = runner.run(&Action::ReadFileHead {
        target: "innocent.txt".to_string(),
    });
    assert!(matches!(
        result.blocked,
        Some(BlockReason::PathEscapeBlocked { .. })
    ));
    assert!(result.detected_flag.is_none());
}

#[test]
fn non_allowlisted_commands_never_spawn() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, Policy::default());
    let marker = runner.scratch_dir().join("marker");

    let result = runner.run(&command(&["touch", &marker.display().to_string()]));
    assert_eq!(
        result.blocked,
        Some(BlockReason::CommandNotAllowed {
            binary: "touch".to_string()
        })
    );
    assert!(!marker.exists());

    let result = runner.run(&command(&["/usr/bin/touch", &marker.display().to_string()]));
    assert_eq!(
        result.blocked,
        Some(BlockReason::CommandNotAllowed {
            binary: "touch".to_string()
        })
    );
    assert!(!marker.exists());
}

#[test]
fn curl_is_network_blocked() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, Policy::default());
    let result = runner.run(&command(&["curl", "http://evil"]));
    assert!(!result.succeeded);
    assert_eq!(
        result.blocked,
        Some(BlockReason::NetworkBlocked {
            token: "curl".to_string()
        })
    );
}

#[cfg(unix)]
#[test]
fn network_tokens_pass_only_when_allowed() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let echo = command(&["sh", "-c", "echo http://example.invalid"]);

    let closed = runner(&fixture, test_policy());
    assert!(matches!(
        closed.run(&echo).blocked,
        Some(BlockReason::NetworkBlocked { .. })
    ));

    let open = runner(
        &fixture,
        Policy {
            allow_network: true,
            ..test_policy()
        },
    );
    let result = open.run(&echo);
    assert!(result.succeeded, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "http://example.invalid");
}

#[cfg(unix)]
#[test]
fn timeout_kills_and_keeps_partial_output() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, test_policy());
    let started = Instant::now();
    // No `exec`: the sleep is a grandchild that inherits the output pipes.
    let result = runner.run(&Action::RunCommand {
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo partial flag{early}; sleep 30; echo late".to_string(),
        ],
        target: None,
        options: ExecOptions {
            timeout_secs: Some(1),
            ..ExecOptions::default()
        },
    });
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out);
    assert!(!result.succeeded);
    assert!(result.stdout.contains("partial"));
    assert!(!result.stdout.contains("late"));
    assert_eq!(result.detected_flag.as_deref(), Some("flag{early}"));
}

#[cfg(unix)]
#[test]
fn commands_run_in_scratch_with_extra_env() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, test_policy());
    let mut extra_env = BTreeMap::new();
    extra_env.insert("MARK".to_string(), "ctf{from_env}".to_string());

    let result = runner.run(&Action::RunCommand {
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "pwd; echo $MARK".to_string(),
        ],
        target: None,
        options: ExecOptions {
            working_dir: Some("jobs/one".to_string()),
            extra_env,
            ..ExecOptions::default()
        },
    });
    assert!(result.succeeded, "stderr: {}", result.stderr);
    let cwd = result.stdout.lines().next().expect("pwd line");
    assert_eq!(Path::new(cwd), runner.scratch_dir().join("jobs/one"));
    assert_eq!(result.detected_flag.as_deref(), Some("ctf{from_env}"));
}

#[test]
fn working_dir_escape_is_blocked() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, test_policy());
    let result = runner.run(&Action::RunCommand {
        command: vec!["ls".to_string()],
        target: None,
        options: ExecOptions {
            working_dir: Some("../../".to_string()),
            ..ExecOptions::default()
        },
    });
    assert!(matches!(
        result.blocked,
        Some(BlockReason::PathEscapeBlocked { .. })
    ));
}

#[cfg(unix)]
#[test]
fn scripts_use_the_configured_interpreter() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(
        &fixture,
        Policy {
            script_interpreter: "sh".to_string(),
            ..test_policy()
        },
    );
    let result = runner.run(&Action::RunScript {
        script_body: "printf 'picoCTF{%s}\\n' scripted".to_string(),
        target: None,
        options: ExecOptions::default(),
    });
    assert!(result.succeeded, "stderr: {}", result.stderr);
    assert_eq!(result.detected_flag.as_deref(), Some("picoCTF{scripted}"));
}

#[test]
fn failed_commands_still_report_output() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let runner = runner(&fixture, test_policy());
    let result = runner.run(&command(&["ls", "definitely-missing-entry"]));
    assert!(!result.succeeded);
    assert!(result.blocked.is_none());
    assert!(!result.stderr.is_empty());
}

#[test]
fn binary_heads_are_decoded_lossily() {
    let fixture = ChallengeFixture::new().expect("fixture");
    fixture
        .write("blob.bin", [0xff, 0xfe, b'f', b'l', b'a', b'g', b'{', b'x', b'}'])
        .expect("write blob");
    let runner = runner(&fixture, Policy::default());
    let result = runner.run(&Action::ReadFileHead {
        target: "blob.bin".to_string(),
    });
    assert!(result.succeeded);
    assert_eq!(result.detected_flag.as_deref(), Some("flag{x}"));
}

#[test]
fn tar_gz_extracts_into_extracted_dir() {
    let fixture = ChallengeFixture::new().expect("fixture");
    write_tar_gz(
        &fixture.challenge_dir().join("evidence.tar.gz"),
        &[("inner/notes.txt", b"the answer is elsewhere\n")],
    );
    let runner = runner(&fixture, Policy::default());

    let result = runner.run(&Action::ExtractArchive {
        target: "evidence.tar.gz".to_string(),
        timeout_secs: None,
    });
    assert!(result.succeeded, "stderr: {}", result.stderr);
    let extracted = runner.extracted_dir().join("inner/notes.txt");
    assert_eq!(
        fs::read_to_string(&extracted).expect("extracted file"),
        "the answer is elsewhere\n"
    );
    assert!(result.stdout.contains("[extracted files]"));
    assert!(result.stdout.contains("inner/notes.txt"));
    assert!(!fixture.challenge_dir().join("inner").exists());

    // Extracting again overwrites in place.
    let again = runner.run(&Action::ExtractArchive {
        target: "evidence.tar.gz".to_string(),
        timeout_secs: None,
    });
    assert!(again.succeeded, "stderr: {}", again.stderr);
}

#[test]
fn unknown_archive_type_is_blocked() {
    let fixture = ChallengeFixture::new().expect("fixture");
    fixture.write("data.rar", "not really").expect("write");
    let runner = runner(&fixture, Policy::default());
    let result = runner.run(&Action::ExtractArchive {
        target: "data.rar".to_string(),
        timeout_secs: None,
    });
    assert_eq!(
        result.blocked,
        Some(BlockReason::UnknownArchiveType {
            target: "data.rar".to_string()
        })
    );
}

#[test]
fn install_requires_policy_and_allowlist() {
    let fixture = ChallengeFixture::new().expect("fixture");
    let ubuntu = HostEnv {
        os: "linux".to_string(),
        is_wsl: false,
        distro: "ubuntu".to_string(),
        distro_like: vec!["debian".to_string()],
    };
    let install = Action::InstallPackages {
        packages: vec!["binwalk".to_string(), "metasploit".to_string()],
        timeout_secs: None,
    };

    let closed = runner(&fixture, Policy::default()).with_host(ubuntu.clone());
    assert_eq!(closed.run(&install).blocked, Some(BlockReason::InstallNotAllowed));

    let open = runner(
        &fixture,
        Policy {
            allow_install: true,
            ..Policy::default()
        },
    )
    .with_host(ubuntu);
    let result = open.run(&install);
    assert_eq!(
        result.blocked,
        Some(BlockReason::PackageNotAllowed {
            package: "metasploit".to_string()
        })
    );
    assert!(result.stdout.is_empty());
}
