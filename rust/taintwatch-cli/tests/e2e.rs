//! End-to-end scenarios over the sample scripts, driven through the library API.

use std::path::PathBuf;
use taintwatch_cli::{analyse, analyse_code, Analysis, AnalysisOptions, CliError, EXIT_CLEAN, EXIT_ERROR, EXIT_MALICIOUS};
use taintwatch_core::asm::assemble;

fn script(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts").join(name)
}

/// Helper: analyse a sample script with `stdin` lines and an option string.
fn run(name: &str, stdin: &[&str], options: Option<&str>) -> Analysis {
    let options = AnalysisOptions {
        options: options.map(str::to_string),
        stdin: stdin.iter().map(|s| s.to_string()).collect(),
        ..AnalysisOptions::default()
    };
    analyse(&script(name), &options).expect("analysis should run")
}

// ─── Verdicts ───

#[test]
fn e2e_input_to_system_is_reported() {
    let analysis = run("input_to_system.twasm", &["rm -rf ~"], None);
    assert!(analysis.report.is_malicious);
    assert!(analysis.report.desc.as_deref().unwrap().contains("reach threat"));
    assert_eq!(analysis.exit_code(), EXIT_MALICIOUS);
    assert!(analysis.error.is_none());
    assert!(analysis.effects.is_empty());
}

#[test]
fn e2e_clean_listing_completes() {
    let analysis = run("clean_listing.twasm", &[], None);
    assert!(!analysis.report.is_malicious);
    assert_eq!(analysis.exit_code(), EXIT_CLEAN);
    assert_eq!(analysis.output, vec!["listed".to_string()]);
}

#[test]
fn e2e_reverse_shell_is_reported() {
    let analysis = run("reverse_shell.twasm", &[], Some("run_mode=debug"));
    assert_eq!(analysis.report.desc.as_deref(), Some("Reverse shell"));
    let debug = analysis.report.debug.as_ref().expect("debug fields");
    assert_eq!(debug.line, Some(8));
}

#[test]
fn e2e_registry_persistence_is_a_malicious_command() {
    let analysis = run("registry_persistence.twasm", &[], None);
    assert_eq!(analysis.report.desc.as_deref(), Some("Execute Malicious Command"));
}

// ─── Runtime options ───

#[test]
fn e2e_guarded_payload_needs_branch_flattening() {
    let plain = run("guarded_payload.twasm", &["print(1)"], None);
    assert!(!plain.report.is_malicious);
    assert_eq!(plain.output, vec!["idle".to_string()]);

    let flat = run("guarded_payload.twasm", &["print(1)"], Some("jump_branch=true"));
    assert!(flat.report.is_malicious);
    assert_eq!(flat.exit_code(), EXIT_MALICIOUS);
}

#[test]
fn e2e_debug_mode_collects_traces_and_report_fields() {
    let analysis = run("input_to_system.twasm", &["id"], Some("run_mode=debug"));
    assert!(!analysis.traces.is_empty());
    let json = analysis.report.to_json();
    assert!(json.contains("\"RunMode\""), "{}", json);
    assert!(json.contains("\"IsMalicious\":true"), "{}", json);

    let release = run("input_to_system.twasm", &["id"], None);
    assert!(release.traces.is_empty());
    assert!(!release.report.to_json().contains("RunMode"));
}

#[test]
fn e2e_disabled_engine_runs_the_script_unwatched() {
    let analysis = run("input_to_system.twasm", &["id"], Some("enable=false"));
    assert!(!analysis.report.is_malicious);
    assert_eq!(analysis.effects.len(), 1);
    assert_eq!(analysis.effects[0].call, "os.system");
}

#[test]
fn e2e_malformed_options_are_errors() {
    let options = AnalysisOptions { options: Some("jump_branch=maybe".into()), ..AnalysisOptions::default() };
    let err = analyse(&script("clean_listing.twasm"), &options).unwrap_err();
    assert!(matches!(err, CliError::Config(_)), "{}", err);
}

// ─── Settings file ───

#[test]
fn e2e_settings_file_adds_sinks() {
    let options = AnalysisOptions {
        config: Some(script("taintwatch.toml")),
        stdin: vec!["payload".into()],
        ..AnalysisOptions::default()
    };
    let analysis = analyse(&script("shellkit_user.twasm"), &options).unwrap();
    assert!(analysis.report.is_malicious);
    // run_mode comes from the file
    assert!(analysis.report.debug.is_some());

    let without = run("shellkit_user.twasm", &["payload"], None);
    assert!(!without.report.is_malicious);
}

#[test]
fn e2e_option_string_overrides_the_settings_file() {
    let options = AnalysisOptions {
        config: Some(script("taintwatch.toml")),
        options: Some("run_mode=release".into()),
        stdin: vec!["payload".into()],
        ..AnalysisOptions::default()
    };
    let analysis = analyse(&script("shellkit_user.twasm"), &options).unwrap();
    assert!(analysis.report.is_malicious);
    assert!(analysis.report.debug.is_none());
}

// ─── Host failures ───

#[test]
fn e2e_uncaught_script_error_exits_with_error() {
    let code = assemble(
        ".code <module>\n LOAD_CONST 1\n LOAD_CONST 0\n BINARY_TRUE_DIVIDE\n RETURN_VALUE\n",
        "div.py",
    )
    .unwrap();
    let analysis = analyse_code(code, &AnalysisOptions::default()).unwrap();
    assert!(!analysis.report.is_malicious);
    assert_eq!(analysis.report.file_name, "div.py");
    assert!(analysis.error.is_some());
    assert_eq!(analysis.exit_code(), EXIT_ERROR);
}

#[test]
fn e2e_instruction_limit_stops_runaway_scripts() {
    let code = assemble(".code <module>\ntop:\n NOP\n JUMP_ABSOLUTE @top\n LOAD_CONST None\n RETURN_VALUE\n", "spin.py").unwrap();
    let options = AnalysisOptions { instruction_limit: Some(1_000), ..AnalysisOptions::default() };
    let analysis = analyse_code(code, &options).unwrap();
    assert_eq!(analysis.exit_code(), EXIT_ERROR);
}

#[test]
fn e2e_argv_and_environment_reach_the_script() {
    let code = assemble(
        r#"
.code <module>
    LOAD_CONST 0
    LOAD_CONST None
    IMPORT_NAME sys
    STORE_NAME sys
    LOAD_CONST 0
    LOAD_CONST None
    IMPORT_NAME os
    STORE_NAME os
    LOAD_NAME print
    LOAD_NAME sys
    LOAD_ATTR argv
    LOAD_CONST 1
    BINARY_SUBSCR
    LOAD_NAME os
    LOAD_ATTR environ
    LOAD_CONST "HOME"
    BINARY_SUBSCR
    CALL_FUNCTION 2
    RETURN_VALUE
"#,
        "args.py",
    )
    .unwrap();
    // unwatched, so sys.argv and os.environ keep their sandbox values
    let options = AnalysisOptions {
        options: Some("enable=false".into()),
        args: vec!["--target".into()],
        env: vec![("HOME".into(), "/root".into())],
        ..AnalysisOptions::default()
    };
    let analysis = analyse_code(code, &options).unwrap();
    assert_eq!(analysis.exit_code(), EXIT_CLEAN);
    assert_eq!(analysis.output, vec!["--target /root".to_string()]);
}
