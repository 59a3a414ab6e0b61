//! Markdown report rendering.
//!
//! The output is a pure function of the findings.

use crate::models::FoundClause;

pub const REPORT_TITLE: &str = "# Contract Analysis Report";

pub const NO_FINDINGS_REPORT: &str = "# Contract Analysis Report\n\n\
**Analysis completed.** No problematic clauses found.\n\n\
The contract appears to comply with German rental law (BGB) and does not contain \
any clauses that violate mandatory tenant protections, are unfair under BGB §307, \
or are exploitative in nature.";

pub fn render_report(clauses: &[FoundClause]) -> String {
    if clauses.is_empty() {
        return NO_FINDINGS_REPORT.to_string();
    }

    let mut lines: Vec<String> = vec![
        REPORT_TITLE.to_string(),
        String::new(),
        format!(
            "**Analysis completed.** Found **{} problematic clause(s)** that violate German tenant protections.",
            clauses.len()
        ),
        String::new(),
        "---".to_string(),
        String::new(),
    ];

    for (i, clause) in clauses.iter().enumerate() {
        let n = i + 1;
        lines.push(format!("## Issue #{}", n));
        lines.push(String::new());
        lines.push("### Contract Clause".to_string());
        lines.push(String::new());

        let content = clause.contract_content.trim();
        if content.is_empty() {
            lines.push("> N/A".to_string());
        } else {
            for line in content.split('\n') {
                let line = line.trim();
                if line.is_empty() {
                    lines.push(">".to_string());
                } else {
                    lines.push(format!("> {}", line));
                }
            }
        }
        lines.push(String::new());

        lines.push("### Legal Analysis".to_string());
        lines.push(String::new());
        let analysis = clause.analysis.trim();
        lines.push(if analysis.is_empty() {
            "N/A".to_string()
        } else {
            analysis.to_string()
        });
        lines.push(String::new());

        if n < clauses.len() {
            lines.push("---".to_string());
            lines.push(String::new());
        }
    }

    lines.join("\n").trim().to_string()
}
