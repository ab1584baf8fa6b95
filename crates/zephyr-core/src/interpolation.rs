//! Placeholder interpolation, secret masking, and condition evaluation.
//!
//! Configuration text may contain `${{ ... }}` placeholders resolved at
//! dispatch time against matrix values, step outputs, dependency job
//! outputs, secrets, and environment variables.

use crate::pipeline::Condition;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").unwrap())
}

/// Build a `${{ secrets.<name> }}` placeholder.
pub fn secret(name: &str) -> String {
    format!("${{{{ secrets.{} }}}}", name)
}

/// Build a `${{ steps.<step>.outputs.<name> }}` placeholder.
pub fn output(step: &str, name: &str) -> String {
    format!("${{{{ steps.{}.outputs.{} }}}}", step, name)
}

/// Build a `${{ matrix.<key> }}` placeholder.
pub fn matrix(key: &str) -> String {
    format!("${{{{ matrix.{} }}}}", key)
}

/// Build a `${{ needs.<job>.outputs.<name> }}` placeholder.
pub fn needs(job: &str, name: &str) -> String {
    format!("${{{{ needs.{}.outputs.{} }}}}", job, name)
}

/// Secrets shorter than four characters are never masked; masking them
/// would leak length information while mangling ordinary text.
const MIN_MASKABLE_SECRET_LEN: usize = 4;

/// Replace every occurrence of each secret value with `***`. Idempotent.
pub fn mask_secrets(input: &str, secrets: &HashMap<String, String>) -> String {
    let mut output = input.to_string();
    for value in secrets.values() {
        if value.len() >= MIN_MASKABLE_SECRET_LEN {
            output = output.replace(value, "***");
        }
    }
    output
}

/// Context for variable interpolation and condition evaluation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Environment variables visible to lookups.
    pub env: HashMap<String, String>,
    /// Matrix values for the current job instance, stringified.
    pub matrix: HashMap<String, String>,
    /// Step outputs: `"step_id.output_key"` -> value.
    pub step_outputs: HashMap<String, String>,
    /// Step outcomes: step id -> `"success"` / `"failure"` / `"skipped"`.
    pub step_outcomes: HashMap<String, String>,
    /// Dependency job outputs: `"job_name.output_key"` -> value.
    pub needs_outputs: HashMap<String, String>,
    /// Dependency job statuses: job name -> status string.
    pub needs_status: HashMap<String, String>,
    /// Secrets resolved for this job.
    pub secrets: HashMap<String, String>,
    /// Branch of the triggering event.
    pub branch: Option<String>,
    /// Event type of the triggering event.
    pub event_type: Option<String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate placeholders in a string.
    ///
    /// Supports:
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ steps.id.outputs.key }}` - step output
    /// - `${{ needs.job.outputs.key }}` - dependency job output
    /// - `${{ secrets.NAME }}` - secret value
    /// - `${{ env.VAR }}` - environment variable
    ///
    /// Unknown bindings resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        placeholder_re()
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        if let Some(rest) = expr.strip_prefix("steps.") {
            if let Some(outputs_idx) = rest.find(".outputs.") {
                let step_id = &rest[..outputs_idx];
                let output_key = &rest[outputs_idx + ".outputs.".len()..];
                let lookup_key = format!("{}.{}", step_id, output_key);
                return self.step_outputs.get(&lookup_key).cloned().unwrap_or_default();
            }
        }

        if let Some(rest) = expr.strip_prefix("needs.") {
            if let Some(outputs_idx) = rest.find(".outputs.") {
                let job_name = &rest[..outputs_idx];
                let output_key = &rest[outputs_idx + ".outputs.".len()..];
                let lookup_key = format!("{}.{}", job_name, output_key);
                return self.needs_outputs.get(&lookup_key).cloned().unwrap_or_default();
            }
        }

        if let Some(name) = expr.strip_prefix("secrets.") {
            return self.secrets.get(name).cloned().unwrap_or_default();
        }

        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.env.get(var_name).cloned().unwrap_or_default();
        }

        // Direct variable lookup
        self.env.get(expr).cloned().unwrap_or_default()
    }

    /// Mask this context's secrets in the input string.
    pub fn mask_secrets(&self, input: &str) -> String {
        mask_secrets(input, &self.secrets)
    }

    /// Evaluate a step or job condition.
    pub fn evaluate_condition(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Bool(b) => *b,
            Condition::Expression(expr) => self.evaluate_expression(expr),
        }
    }

    /// Evaluate an expression over the condition fields.
    ///
    /// Supports boolean literals, `==`, `!=`, and ` contains `. Operands
    /// are quoted literals or fields (`branch`, `event.type`,
    /// `needs.<job>.status`, `steps.<id>.outcome`). Unrecognised
    /// expressions evaluate false.
    pub fn evaluate_expression(&self, expr: &str) -> bool {
        let trimmed = expr.trim();

        if trimmed == "true" {
            return true;
        }
        if trimmed == "false" {
            return false;
        }

        if let Some((left, right)) = trimmed.split_once("==") {
            return self.operand(left) == self.operand(right);
        }
        if let Some((left, right)) = trimmed.split_once("!=") {
            return self.operand(left) != self.operand(right);
        }
        if let Some((left, right)) = trimmed.split_once(" contains ") {
            return self.operand(left).contains(&self.operand(right));
        }

        false
    }

    /// Resolve one operand: a quoted literal or a condition field.
    fn operand(&self, raw: &str) -> String {
        let token = raw.trim();

        if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
            || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
        {
            return token[1..token.len() - 1].to_string();
        }

        match token {
            "branch" => return self.branch.clone().unwrap_or_default(),
            "event.type" => return self.event_type.clone().unwrap_or_default(),
            _ => {}
        }

        if let Some(rest) = token.strip_prefix("needs.") {
            if let Some(job) = rest.strip_suffix(".status") {
                return self.needs_status.get(job).cloned().unwrap_or_default();
            }
        }
        if let Some(rest) = token.strip_prefix("steps.") {
            if let Some(step) = rest.strip_suffix(".outcome") {
                return self.step_outcomes.get(step).cloned().unwrap_or_default();
            }
        }

        token.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("os".to_string(), "ubuntu".to_string());
        ctx.step_outputs
            .insert("build.version".to_string(), "1.2.3".to_string());
        ctx.needs_outputs
            .insert("compile.artifact".to_string(), "app.tar".to_string());
        ctx.needs_status
            .insert("compile".to_string(), "success".to_string());
        ctx.step_outcomes
            .insert("build".to_string(), "failure".to_string());
        ctx.secrets
            .insert("TOKEN".to_string(), "s3cr3tvalue".to_string());
        ctx.branch = Some("main".to_string());
        ctx.event_type = Some("push".to_string());
        ctx
    }

    #[test]
    fn test_helpers_round_trip_through_interpolation() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate(&matrix("os")), "ubuntu");
        assert_eq!(ctx.interpolate(&output("build", "version")), "1.2.3");
        assert_eq!(ctx.interpolate(&needs("compile", "artifact")), "app.tar");
        assert_eq!(ctx.interpolate(&secret("TOKEN")), "s3cr3tvalue");
    }

    #[test]
    fn test_missing_bindings_resolve_empty() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("v=${{ matrix.missing }}"), "v=");
        assert_eq!(ctx.interpolate("${{ steps.nope.outputs.x }}"), "");
    }

    #[test]
    fn test_mask_secrets_idempotent() {
        let ctx = ctx();
        let once = ctx.mask_secrets("token is s3cr3tvalue ok");
        assert_eq!(once, "token is *** ok");
        assert_eq!(ctx.mask_secrets(&once), once);
    }

    #[test]
    fn test_short_secrets_never_masked() {
        let mut secrets = HashMap::new();
        secrets.insert("PIN".to_string(), "abc".to_string());
        assert_eq!(mask_secrets("pin abc here", &secrets), "pin abc here");
        secrets.insert("KEY".to_string(), "abcd".to_string());
        assert_eq!(mask_secrets("key abcd here", &secrets), "key *** here");
    }

    #[test]
    fn test_condition_branch_equality() {
        let ctx = ctx();
        assert!(ctx.evaluate_expression("branch == 'main'"));
        assert!(!ctx.evaluate_expression("branch == 'release'"));
        assert!(ctx.evaluate_expression("branch != 'release'"));
    }

    #[test]
    fn test_condition_event_and_needs_fields() {
        let ctx = ctx();
        assert!(ctx.evaluate_expression("event.type == 'push'"));
        assert!(ctx.evaluate_expression("needs.compile.status == 'success'"));
        assert!(ctx.evaluate_expression("steps.build.outcome == 'failure'"));
    }

    #[test]
    fn test_condition_literals_and_unknown() {
        let ctx = ctx();
        assert!(ctx.evaluate_condition(&Condition::Bool(true)));
        assert!(!ctx.evaluate_condition(&Condition::Expression("false".into())));
        assert!(!ctx.evaluate_expression("garbage expression"));
    }
}
