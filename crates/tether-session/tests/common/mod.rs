//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use tether_session::{ResponseStrategy, Session};
use tether_types::{EngineConfig, SessionConfig, TimingConfig};

/// A POSIX shell stand-in for the engine.
///
/// It echoes every input line to the log with a line number, prints the
/// argument of `%put` on its own log line, opens and closes a markup
/// document on the renderer directives, prints a small listing for
/// `proc print`, prints the listing marker, sleeps on `call sleep(`,
/// exits on `endsas;` and exits 3 on `abort abend`.
///
/// SIGINT during a sleep ends the step. Started with `-prompt` it instead
/// asks the cancel menu on stdout and reads the answer from stdin.
const STAND_IN: &str = r#"#!/bin/sh
prompting=0
[ "$1" = "-prompt" ] && prompting=1
n=0
html=0
interrupted=0
trap 'interrupted=1' INT

run_sleep() {
    interrupted=0
    sleep "$1" &
    sleeper=$!
    wait "$sleeper"
    [ "$interrupted" = 1 ] || return 0
    kill "$sleeper" 2>/dev/null
    if [ "$prompting" = 1 ]; then
        printf 'Select:\n  1. Halt DATA step/proc.\n  2. Cancel Submitted Statements\n  T. Terminate the SAS System\n  C. Cancel the dialog\n?\n'
        while IFS= read -r answer; do
            case "$answer" in
                1|2|C|T) break ;;
            esac
        done
        [ "$answer" = T ] && exit 1
        printf 'NOTE: Submitted statements cancelled.\n' >&2
    else
        printf 'NOTE: DATA step interrupted.\n' >&2
    fi
}

while IFS= read -r line; do
    n=$((n + 1))
    printf '%d    %s\n' "$n" "$line" >&2
    case "$line" in
        '%put '*)
            msg=${line#'%put '}
            printf '%s\n' "${msg%;}" >&2 ;;
    esac
    case "$line" in
        *'ods html5 file=stdout'*)
            html=1
            printf '<!DOCTYPE html>\n<html>\n<head>\n<style>\n/*<![CDATA[*/\n.body { font-size: x-small; }\n/*]]>*/\n</style>\n</head>\n<body class="c body">\n' ;;
    esac
    case "$line" in
        *'proc print'*)
            if [ "$html" = 1 ]; then
                printf '<table class="table">\n<tr><th>Obs</th><th>x</th></tr>\n<tr><td>1</td><td>1</td></tr>\n<tr><td>2</td><td>4</td></tr>\n</table>\n'
            else
                printf '\fThe SAS System\n\nObs    x\n  1    1\n  2    4\n'
            fi ;;
    esac
    case "$line" in
        *'Tether listing marker'*)
            printf '\fTether listing marker\n' ;;
    esac
    case "$line" in
        *'call sleep('*)
            run_sleep 5 ;;
    esac
    case "$line" in
        *'abort abend'*)
            exit 3 ;;
    esac
    case "$line" in
        *'ods html5 close'*)
            if [ "$html" = 1 ]; then
                printf '</body>\n</html>\n'
            fi
            html=0 ;;
    esac
    case "$line" in
        *'endsas;'*)
            exit 0 ;;
    esac
done
"#;

/// Write the stand-in engine into a fresh temp directory.
pub fn stand_in_engine() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("engine.sh");
    fs::write(&path, STAND_IN).expect("should write stand-in engine");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("should make stand-in engine executable");
    (dir, path)
}

/// Timing tuned for a local shell engine.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        idle_delay_ms: 5,
        log_poll_ms: 50,
        attention_pause_ms: 100,
        attention_poll_ms: 20,
        shutdown_grace_ms: 2000,
        kill_poll_ms: 20,
        ..TimingConfig::default()
    }
}

pub fn session_config(engine: &Path, options: &[&str]) -> SessionConfig {
    SessionConfig {
        engine: EngineConfig {
            engine_path: engine.to_path_buf(),
            options: options.iter().map(|o| o.to_string()).collect(),
            ..EngineConfig::default()
        },
        timing: fast_timing(),
    }
}

/// Start a session on a fresh stand-in engine.
pub fn start_session(options: &[&str], strategy: ResponseStrategy) -> (TempDir, Session) {
    let (dir, engine) = stand_in_engine();
    let session = Session::start(session_config(&engine, options), strategy)
        .expect("stand-in engine should start");
    (dir, session)
}
