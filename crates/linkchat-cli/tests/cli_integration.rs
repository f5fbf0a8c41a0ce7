//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! Several identities share one temporary data directory, so each command
//! runs against the same local replica.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command acting as `alias` in a temporary data directory
fn cli_cmd(data_dir: &TempDir, alias: &str) -> Command {
    let mut cmd = Command::cargo_bin("linkchat").expect("Failed to find linkchat binary");
    cmd.arg("--data-dir").arg(data_dir.path()).arg("--as").arg(alias);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("Failed to run linkchat");
    assert!(output.status.success(), "command failed: {:?}", output);
    String::from_utf8(output.stdout).expect("stdout is UTF-8")
}

/// Extract the value of an indented `Label: value` line
fn extract_field(output: &str, label: &str) -> Option<String> {
    let prefix = format!("  {}: ", label);
    output
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().to_string())
}

fn public_key(data_dir: &TempDir, alias: &str) -> String {
    let output = stdout_of(cli_cmd(data_dir, alias).args(["identity", "show"]));
    extract_field(&output, "Public key").expect("identity show prints a public key")
}

// ============================================================================
// Identity Command Tests
// ============================================================================

#[test]
fn test_identity_show() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir, "alice")
        .args(["identity", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("Alias: alice"))
        .stdout(predicate::str::contains("Public key:"));
}

#[test]
fn test_identity_is_persisted() {
    let data_dir = TempDir::new().unwrap();

    let first = public_key(&data_dir, "alice");
    let second = public_key(&data_dir, "alice");
    assert_eq!(first, second);
    assert_ne!(first, public_key(&data_dir, "bob"));
    assert!(data_dir.path().join("identities").join("alice.json").exists());
}

#[test]
fn test_identity_rename() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir, "alice")
        .args(["identity", "rename", "Alice Liddell"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: Alice Liddell"));

    cli_cmd(&data_dir, "alice")
        .args(["identity", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: Alice Liddell"));
}

// ============================================================================
// Contact Command Tests
// ============================================================================

#[test]
fn test_contact_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir, "alice")
        .args(["contact", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No contacts."));
}

#[test]
fn test_contact_add_and_list() {
    let data_dir = TempDir::new().unwrap();
    let bob = public_key(&data_dir, "bob");

    cli_cmd(&data_dir, "alice")
        .args(["contact", "add", &bob])
        .assert()
        .success()
        .stdout(predicate::str::contains("Contact added."))
        .stdout(predicate::str::contains("Name: bob"));

    cli_cmd(&data_dir, "alice")
        .args(["contact", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Contacts (1):"))
        .stdout(predicate::str::contains(bob.as_str()));
}

#[test]
fn test_contact_add_invalid_key() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir, "alice")
        .args(["contact", "add", "not-a-key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid public key"));
}

// ============================================================================
// Invite & Messaging Tests
// ============================================================================

#[test]
fn test_invite_accept_and_chat() {
    let data_dir = TempDir::new().unwrap();
    let alice = public_key(&data_dir, "alice");
    let bob = public_key(&data_dir, "bob");

    cli_cmd(&data_dir, "alice")
        .args(["invite", "send", &bob, "hi bob"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invite sent."));

    let invites = stdout_of(cli_cmd(&data_dir, "bob").args(["invite", "list"]));
    assert!(invites.contains("Pending invites (1):"));
    assert!(invites.contains("Text: hi bob"));
    let request_id = extract_field(&invites, "ID").expect("invite list prints an ID");

    cli_cmd(&data_dir, "bob")
        .args(["invite", "accept", &request_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invite accepted."));

    cli_cmd(&data_dir, "bob")
        .args(["invite", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending invites."));

    cli_cmd(&data_dir, "bob")
        .args(["send", &alice, "hello alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Message sent."));

    cli_cmd(&data_dir, "alice")
        .args(["history", &bob])
        .assert()
        .success()
        .stdout(predicate::str::contains("bob: hello alice"));
}

#[test]
fn test_invite_decline() {
    let data_dir = TempDir::new().unwrap();
    let bob = public_key(&data_dir, "bob");

    cli_cmd(&data_dir, "alice")
        .args(["invite", "send", &bob])
        .assert()
        .success();

    let invites = stdout_of(cli_cmd(&data_dir, "bob").args(["invite", "list"]));
    let request_id = extract_field(&invites, "ID").expect("invite list prints an ID");

    cli_cmd(&data_dir, "bob")
        .args(["invite", "decline", &request_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invite declined."));

    cli_cmd(&data_dir, "bob")
        .args(["conversation", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No conversations."));
}

#[test]
fn test_group_invite_lists_group_conversation() {
    let data_dir = TempDir::new().unwrap();
    let bob = public_key(&data_dir, "bob");
    let carol = public_key(&data_dir, "carol");

    let created = stdout_of(cli_cmd(&data_dir, "alice").args([
        "invite", "group", &bob, &carol, "--name", "crew",
    ]));
    assert!(created.contains("Group created."));
    let group = extract_field(&created, "Group").expect("group invite prints the group key");

    let invites = stdout_of(cli_cmd(&data_dir, "carol").args(["invite", "list"]));
    assert!(invites.contains("Group members: 2"));
    let request_id = extract_field(&invites, "ID").expect("invite list prints an ID");

    cli_cmd(&data_dir, "carol")
        .args(["invite", "accept", &request_id])
        .assert()
        .success();

    cli_cmd(&data_dir, "carol")
        .args(["conversation", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"label\": \"crew\""))
        .stdout(predicate::str::contains(group.as_str()));
}

#[test]
fn test_send_to_unknown_conversation_fails() {
    let data_dir = TempDir::new().unwrap();
    let bob = public_key(&data_dir, "bob");

    cli_cmd(&data_dir, "alice")
        .args(["send", &bob, "hello?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Conversation not found"));
}

#[test]
fn test_watch_stops_after_deadline() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir, "alice")
        .args(["watch", "--seconds", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Watching as alice"));
}
