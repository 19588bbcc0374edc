use super::{CandidateOutcome, RunReport};
use crate::fingerprint;
use crate::model::MetricImprovement;

pub fn print_summary(report: &RunReport, verbose: bool) {
    eprintln!(
        "\nRun {}: {} candidate queries ranked by {}",
        report.run_id, report.totals.candidates, report.expense_metric
    );

    for c in &report.candidates {
        let label = format!("#{:<2} {}", c.index, c.query_id);
        match &c.outcome {
            CandidateOutcome::Validated { delta } => {
                let icon = if delta.is_faster() { "✅" } else { "➖" };
                eprintln!(
                    "{} {:<28} time {}  bytes {}",
                    icon,
                    label,
                    pct(delta.execution_time()),
                    pct(delta.bytes_scanned())
                );
            }
            CandidateOutcome::Mismatch { detail } => {
                eprintln!("❌ {:<28} MISMATCH", label);
                eprintln!("      {}", detail);
            }
            CandidateOutcome::PerformanceDataUnavailable => {
                eprintln!("⏳ {:<28} results match, performance data unavailable", label);
            }
            CandidateOutcome::OptimizationUnavailable => {
                eprintln!("⏭️  {:<28} no optimization proposed", label);
            }
            CandidateOutcome::ValidationFailed { reason } => {
                eprintln!("⚠️  {:<28} validation failed: {}", label, reason);
            }
            CandidateOutcome::NotValidated => {
                eprintln!("·  {:<28} not validated", label);
            }
        }

        if verbose {
            eprintln!("      fingerprint: {}", fingerprint::short(&c.fingerprint));
            if !c.tables.is_empty() {
                eprintln!("      tables: {}", c.tables.join(", "));
            }
            for issue in &c.issues {
                eprintln!("      [{}] {}", issue.stage, issue.message);
            }
            if let Some(r) = &c.rationale {
                for line in r.lines().take(6) {
                    eprintln!("      > {}", line);
                }
            }
        }
    }

    let t = &report.totals;
    eprintln!(
        "\nSummary: {} candidates, {} proposed, {} validated ({} faster), {} mismatched, {} unavailable, {} failed",
        t.candidates, t.proposed, t.validated, t.faster, t.mismatched, t.unavailable, t.failed
    );
}

fn pct(m: MetricImprovement) -> String {
    match m.improvement_pct {
        Some(p) => format!("{:+.1}% ({} -> {})", p, m.original, m.optimized),
        None => format!("n/a ({} -> {})", m.original, m.optimized),
    }
}
