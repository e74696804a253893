//! systemd unit rendering for [`ServiceUnit`]s.

use std::path::Path;

use edgeprep_types::ServiceUnit;

/// Suffix a bare dependency name with `.service`; names that already carry
/// a unit type (`.target`, `.socket`, ...) are kept.
pub fn systemd_name(name: &str) -> String {
    const TYPES: &[&str] = &[
        ".service", ".target", ".socket", ".mount", ".path", ".timer", ".device",
    ];
    if TYPES.iter().any(|t| name.ends_with(t)) {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Render the unit file. `quiesce_bin` is the `edgeprep` binary used for
/// `ExecStopPost=` on units that drive actuators.
pub fn render_unit(unit: &ServiceUnit, quiesce_bin: &Path) -> String {
    let mut out = String::from("# Managed by edgeprep. Local edits are overwritten.\n[Unit]\n");
    out.push_str(&format!("Description=edgeprep service {}\n", unit.name));
    if !unit.dependencies.is_empty() {
        let deps: Vec<String> = unit.dependencies.iter().map(|d| systemd_name(d)).collect();
        let deps = deps.join(" ");
        out.push_str(&format!("After={deps}\nWants={deps}\n"));
    }

    out.push_str("\n[Service]\nType=simple\n");
    let mut exec = vec![quote(&unit.executable_path.display().to_string())];
    exec.extend(unit.args.iter().map(|a| quote(a)));
    out.push_str(&format!("ExecStart={}\n", exec.join(" ")));
    if let Some(dir) = &unit.working_directory {
        out.push_str(&format!("WorkingDirectory={}\n", dir.display()));
    }
    out.push_str(&format!("Nice={}\n", unit.niceness));
    out.push_str(&format!("CPUWeight={}\n", unit.resource_weight));
    out.push_str(&format!("Restart={}\n", unit.restart_policy.as_systemd()));
    if unit.controls_actuators() {
        // Runs after every exit, including crashes and OOM kills.
        out.push_str(&format!(
            "ExecStopPost={} quiesce --unit {}\n",
            quiesce_bin.display(),
            unit.name
        ));
    }

    out.push_str("\n[Install]\nWantedBy=multi-user.target\n");
    out
}
