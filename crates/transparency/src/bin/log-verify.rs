//! Log Verify CLI
//!
//! Offline verification of transparency log artifacts: inclusion proofs,
//! consistency proofs between two signed tree heads, and full audits of a
//! SQLite log store. Needs nothing from a running node.
//!
//! Every command takes the log operator's public key, obtained out of band,
//! and checks tree head signatures against it. The key embedded in a head is
//! never trusted.

use qlafs_core::digest::from_hex;
use qlafs_core::PublicKeyBytes;
use qlafs_transparency::{
    leaf_hash, verify_consistency, verify_inclusion, ConsistencyProof, InclusionProof,
    SignedTreeHead,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

/// JSON output for every command
#[derive(Debug, Serialize)]
struct VerifyOutput {
    command: String,
    valid: bool,
    tree_size: Option<u64>,
    root_hash: Option<String>,
    message: String,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read {} file: {}", what, e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {} file: {}", what, e))
}

fn report(output: VerifyOutput, json: bool) -> Result<(), String> {
    if json {
        let rendered = serde_json::to_string_pretty(&output)
            .map_err(|e| format!("Failed to render output: {}", e))?;
        println!("{}", rendered);
    } else if output.valid {
        println!("✓ {}", output.message);
        if let Some(size) = output.tree_size {
            println!("  Tree size: {}", size);
        }
        if let Some(root) = &output.root_hash {
            println!("  Root: {}", root);
        }
    } else {
        println!("✗ {}", output.message);
    }

    if output.valid {
        Ok(())
    } else {
        Err(output.message)
    }
}

fn parse_log_key(value: &str) -> Result<PublicKeyBytes, String> {
    from_hex(value).map_err(|e| format!("Invalid log key: {}", e))
}

fn cmd_inclusion(
    log_key: &PublicKeyBytes,
    entry_hash: &str,
    proof: PathBuf,
    head: PathBuf,
    json: bool,
) -> Result<(), String> {
    let entry_hash = from_hex(entry_hash).map_err(|e| format!("Invalid entry hash: {}", e))?;
    let proof: InclusionProof = read_json(&proof, "proof")?;
    let head: SignedTreeHead = read_json(&head, "tree head")?;

    let outcome = head
        .verify_with(log_key)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            if proof.tree_size != head.tree_size {
                return Err(format!(
                    "proof is for tree size {}, head is for {}",
                    proof.tree_size, head.tree_size
                ));
            }
            verify_inclusion(&leaf_hash(&entry_hash), &proof, &head.root_hash)
                .map_err(|e| e.to_string())
        });

    report(
        VerifyOutput {
            command: "inclusion".to_string(),
            valid: outcome.is_ok(),
            tree_size: Some(head.tree_size),
            root_hash: Some(head.root_hex()),
            message: match outcome {
                Ok(()) => format!("Entry {} is included", proof.leaf_index),
                Err(e) => format!("Inclusion proof is INVALID: {}", e),
            },
        },
        json,
    )
}

fn cmd_consistency(
    log_key: &PublicKeyBytes,
    proof: PathBuf,
    old_head: PathBuf,
    new_head: PathBuf,
    json: bool,
) -> Result<(), String> {
    let proof: ConsistencyProof = read_json(&proof, "proof")?;
    let old_head: SignedTreeHead = read_json(&old_head, "old tree head")?;
    let new_head: SignedTreeHead = read_json(&new_head, "new tree head")?;

    let outcome = old_head
        .verify_with(log_key)
        .and_then(|_| new_head.verify_with(log_key))
        .map_err(|e| e.to_string())
        .and_then(|_| {
            if proof.old_size != old_head.tree_size || proof.new_size != new_head.tree_size {
                return Err("proof sizes do not match the tree heads".to_string());
            }
            verify_consistency(&proof, &old_head.root_hash, &new_head.root_hash)
                .map_err(|e| e.to_string())
        });

    report(
        VerifyOutput {
            command: "consistency".to_string(),
            valid: outcome.is_ok(),
            tree_size: Some(new_head.tree_size),
            root_hash: Some(new_head.root_hex()),
            message: match outcome {
                Ok(()) => format!(
                    "Tree of size {} is a prefix of tree of size {}",
                    old_head.tree_size, new_head.tree_size
                ),
                Err(e) => format!("Consistency proof is INVALID: {}", e),
            },
        },
        json,
    )
}

#[cfg(feature = "sqlite")]
fn cmd_audit(log_key: &PublicKeyBytes, db: PathBuf, json: bool) -> Result<(), String> {
    use qlafs_transparency::{check_chain, root, LogStore, SqliteStore};

    let outcome = (|| -> Result<(u64, Option<SignedTreeHead>), String> {
        let mut store = SqliteStore::open(&db).map_err(|e| e.to_string())?;
        let stored = store.load().map_err(|e| e.to_string())?;
        check_chain(&stored.entries).map_err(|e| e.to_string())?;

        let leaves: Vec<_> = stored.entries.iter().map(|e| leaf_hash(&e.entry_hash)).collect();
        for head in &stored.heads {
            head.verify_with(log_key).map_err(|e| e.to_string())?;
            let size = head.tree_size as usize;
            if size > leaves.len() || root(&leaves[..size]) != head.root_hash {
                return Err(format!("tree head at size {} does not match entries", size));
            }
        }
        Ok((leaves.len() as u64, stored.heads.last().cloned()))
    })();

    let (valid, tree_size, root_hash, message) = match outcome {
        Ok((entries, head)) => (
            true,
            Some(entries),
            head.as_ref().map(|h| h.root_hex()),
            format!("Audit passed: {} entries", entries),
        ),
        Err(e) => (false, None, None, format!("Audit FAILED: {}", e)),
    };

    report(
        VerifyOutput {
            command: "audit".to_string(),
            valid,
            tree_size,
            root_hash,
            message,
        },
        json,
    )
}

#[cfg(not(feature = "sqlite"))]
fn cmd_audit(_log_key: &PublicKeyBytes, _db: PathBuf, _json: bool) -> Result<(), String> {
    Err("audit requires the sqlite feature".to_string())
}

fn print_usage() {
    println!("Log Verify - Offline transparency log verification");
    println!();
    println!("USAGE:");
    println!("    log-verify inclusion --log-key <hex> --entry-hash <hex> --proof <file> --head <file> [--json]");
    println!("    log-verify consistency --log-key <hex> --proof <file> --old-head <file> --new-head <file> [--json]");
    println!("    log-verify audit --log-key <hex> --db <file> [--json]");
    println!();
    println!("OPTIONS:");
    println!("    --log-key      Hex Ed25519 public key of the log operator");
    println!();
    println!("COMMANDS:");
    println!("    inclusion      Verify an entry is in a signed tree");
    println!("    consistency    Verify one signed tree extends another");
    println!("    audit          Re-walk a log store's hash chain and sealed roots");
}

/// Value following `name` in `args`
fn flag(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn required(args: &[String], name: &str) -> Result<String, String> {
    flag(args, name).ok_or_else(|| format!("Missing {} argument", name))
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Error: Usage: log-verify <command> [options]");
        println!();
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];
    let json = rest.iter().any(|a| a == "--json");

    let log_key = || required(rest, "--log-key").and_then(|key| parse_log_key(&key));
    let result = match command {
        "inclusion" => (|| {
            let log_key = log_key()?;
            let entry_hash = required(rest, "--entry-hash")?;
            let proof = required(rest, "--proof")?;
            let head = required(rest, "--head")?;
            cmd_inclusion(&log_key, &entry_hash, proof.into(), head.into(), json)
        })(),
        "consistency" => (|| {
            let log_key = log_key()?;
            let proof = required(rest, "--proof")?;
            let old_head = required(rest, "--old-head")?;
            let new_head = required(rest, "--new-head")?;
            cmd_consistency(&log_key, proof.into(), old_head.into(), new_head.into(), json)
        })(),
        "audit" => (|| {
            let log_key = log_key()?;
            let db = required(rest, "--db")?;
            cmd_audit(&log_key, db.into(), json)
        })(),
        _ => {
            print_usage();
            Err(format!("Unknown command: {}", command))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
