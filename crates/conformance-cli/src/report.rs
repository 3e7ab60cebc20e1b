use conformance_harness::prelude::*;

/// One summary line for a verdict.
pub fn summary_line(verdict: &Verdict) -> String {
    let s = &verdict.stats;
    let status = if verdict.passed { "OK" } else { "FAIL" };
    if verdict.scenario.starts_with("proxy") {
        return format!(
            "{} [{}]: chunks={} content_len={} finish_reason={} model={} errors={} => {status}",
            verdict.scenario,
            verdict.backend,
            s.chat_chunks,
            s.chat_content().len(),
            s.finish_reason.as_deref().unwrap_or("-"),
            s.chat_model.as_deref().unwrap_or("-"),
            s.errors.len(),
        );
    }
    let models = s.assistant_models.iter().cloned().collect::<Vec<_>>().join(",");
    let queued = verdict
        .queued_ok
        .map_or_else(|| "-".to_string(), |q| q.to_string());
    format!(
        "{}: assistant_messages={} thinking={} text_deltas={} tool_calls={} tool_results={} \
models={} tools={} queued={queued} errors={} => {status}",
        verdict.backend,
        s.assistant_messages,
        s.thinking_chunks,
        s.text_deltas,
        s.tool_calls,
        s.tool_results,
        if models.is_empty() { "-" } else { models.as_str() },
        s.tool_names.len(),
        s.errors.len(),
    )
}

/// Human-readable report: a summary line per verdict, then its reasons.
pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    for verdict in &report.verdicts {
        out.push_str(&summary_line(verdict));
        out.push('\n');
        for reason in &verdict.failure_reasons {
            out.push_str("  - ");
            out.push_str(reason);
            out.push('\n');
        }
    }
    out
}

pub fn render_json(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
