use super::RunReport;
use std::path::Path;

pub fn write_json(report: &RunReport, out: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, ExpenseMetric, OptimizationRun, RunId};

    #[test]
    fn writes_pretty_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("nested/report.json");
        let run = OptimizationRun::new(RunId(3), "r".into(), DateRange::last_days(1), ExpenseMetric::BytesScanned);
        write_json(&RunReport::build(&run), &out)?;

        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out)?)?;
        assert_eq!(v["run_id"], 3);
        assert_eq!(v["expense_metric"], "bytes_scanned");
        assert_eq!(v["totals"]["candidates"], 0);
        Ok(())
    }
}
