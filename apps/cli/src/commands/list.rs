//! `optibench list`

use super::harness;
use anyhow::Result;
use colored::Colorize;
use serde_json::json;

pub fn execute(json_output: bool) -> Result<()> {
    let harness = harness();
    let workloads = harness.workloads();
    let submissions = harness.submissions();

    let workload_rows: Vec<(String, &str)> = workloads
        .list_names()
        .into_iter()
        .map(|name| {
            let description = workloads.import(&name).map(|f| f.description()).unwrap_or_default();
            (name, description)
        })
        .collect();
    let submission_rows: Vec<(String, &str)> = submissions
        .list_names()
        .into_iter()
        .map(|name| {
            let description = submissions.import(&name).map(|f| f.description()).unwrap_or_default();
            (name, description)
        })
        .collect();

    if json_output {
        let entries = |rows: &[(String, &str)]| {
            rows.iter().map(|(name, description)| json!({ "name": name, "description": description })).collect::<Vec<_>>()
        };
        let listing = json!({
            "workloads": entries(&workload_rows),
            "submissions": entries(&submission_rows),
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    for (title, rows) in [("Workloads", &workload_rows), ("Submissions", &submission_rows)] {
        println!();
        println!("{}", format!("{title} ({})", rows.len()).bold().green());
        println!("{}", "─".repeat(72));
        for (name, description) in rows {
            println!("{:<18} {}", name.cyan(), description.dimmed());
        }
    }
    println!();
    Ok(())
}
