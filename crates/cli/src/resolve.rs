//! `intake resolve` -- print the normalized definition of one funnel.

use std::path::Path;

use intake_engine::{FunnelDefinition, FunnelResolver, FunnelSource};

use crate::seed;
use crate::OutputFormat;

pub(crate) async fn cmd_resolve(
    funnels: &Path,
    slug: &str,
    output: OutputFormat,
) -> Result<String, String> {
    let storage = seed::load_storage(Some(funnels))?;
    let definition = FunnelResolver::new(&storage)
        .resolve(slug)
        .await
        .map_err(|e| format!("{} ({})", e, e.code()))?;

    match output {
        OutputFormat::Json => serde_json::to_string_pretty(&definition)
            .map_err(|e| format!("failed to serialize definition: {}", e)),
        OutputFormat::Text => Ok(render_text(&definition)),
    }
}

fn render_text(definition: &FunnelDefinition) -> String {
    let source = match &definition.source {
        FunnelSource::Legacy { funnel_id } => format!("legacy graph {}", funnel_id),
        FunnelSource::Manifest { version } => format!("manifest v{}", version),
    };
    let mut out = format!(
        "{} ({}, {} steps)\n",
        definition.slug,
        source,
        definition.steps.len()
    );
    for step in &definition.steps {
        out.push_str(&format!("  {}. {} [{}]", step.order_index, step.id, step.kind));
        if !step.question_ids.is_empty() {
            let questions: Vec<String> = step
                .question_ids
                .iter()
                .map(|q| {
                    if step.required_question_ids.contains(q) {
                        format!("{}*", q)
                    } else {
                        q.clone()
                    }
                })
                .collect();
            out.push_str(&format!(" {}", questions.join(", ")));
        }
        out.push('\n');
    }
    out
}
