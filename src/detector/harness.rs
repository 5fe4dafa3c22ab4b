//! Harness protocol between the host and a detector child process
//!
//! The harness runs inside the child. It imports the detector module,
//! calls its default export with the target and appends JSON report lines
//! to a report file in the staging directory. The detector's own stdout
//! and stderr never carry a verdict, so however much it prints, the
//! report survives the harness exiting.

use super::Execution;
use serde::Deserialize;

/// Report file written by the harness, relative to the staging directory
pub const REPORT_FILE: &str = "report.jsonl";

/// File name the default harness is staged under
pub const NODE_HARNESS_FILE: &str = "harness.mjs";

/// Extension given to staged detector modules for the default harness
pub const NODE_MODULE_EXTENSION: &str = "mjs";

/// Node.js harness. argv: `<module path> <target> <report path>`.
pub const NODE_HARNESS: &str = r#"import { appendFileSync } from 'node:fs';
import { pathToFileURL } from 'node:url';

const [modulePath, target, reportPath] = process.argv.slice(2);

const report = (value) => appendFileSync(reportPath, `${JSON.stringify(value)}\n`);
const describe = (err) => String(err && err.message !== undefined ? err.message : err);

let detect;
try {
    const mod = await import(pathToFileURL(modulePath).href);
    detect = mod.default;
} catch (err) {
    report({ status: 'load_error', message: describe(err) });
    process.exit(0);
}

if (typeof detect !== 'function') {
    report({ status: 'load_error', message: 'Detector module has no default export function' });
    process.exit(0);
}

report({ status: 'loaded' });

try {
    const result = await detect(target);
    report({ status: 'returned', value: Boolean(result) });
} catch (err) {
    report({ status: 'runtime_error', message: describe(err) });
}
process.exit(0);
"#;

/// One report line emitted by the harness
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HarnessReport {
    Loaded,
    Returned { value: bool },
    LoadError { message: String },
    RuntimeError { message: String },
}

/// Extracts harness reports from the report file contents, in emission order.
/// Lines that are not reports are skipped.
pub fn parse_reports(contents: &str) -> Vec<HarnessReport> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Decides the execution result of a child that ran to exit.
///
/// A terminal report wins. Without one, a child that got past loading
/// died inside the detector and counts as a runtime error; otherwise the
/// module never loaded.
pub fn interpret(reports: &[HarnessReport], exit_summary: &str) -> Execution {
    let terminal = reports
        .iter()
        .rev()
        .find(|r| !matches!(r, HarnessReport::Loaded));

    match terminal {
        Some(HarnessReport::Returned { value }) => Execution::Returned(*value),
        Some(HarnessReport::LoadError { message }) => Execution::LoadFailed(message.clone()),
        Some(HarnessReport::RuntimeError { message }) => Execution::Threw(message.clone()),
        Some(HarnessReport::Loaded) | None => {
            if reports.contains(&HarnessReport::Loaded) {
                Execution::Threw(format!(
                    "Detector terminated without a result ({exit_summary})"
                ))
            } else {
                Execution::LoadFailed(format!(
                    "Detector runtime produced no report ({exit_summary})"
                ))
            }
        }
    }
}
