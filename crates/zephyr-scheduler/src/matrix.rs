//! Matrix expansion for parallel job generation.

use std::collections::HashMap;
use zephyr_core::interpolation::InterpolationContext;
use zephyr_core::pipeline::{JobDefinition, MatrixSelection, MatrixValue, StepKind};

/// One concrete combination of matrix values.
#[derive(Debug, Clone)]
pub struct MatrixCombination {
    pub index: usize,
    /// `(dimension, value)` pairs in declaration order; synthesised
    /// inclusion-only keys follow the declared dimensions.
    pub values: Vec<(String, MatrixValue)>,
    /// Comma-joined `key=value` list, e.g. `os=ubuntu, node=18`.
    pub name_suffix: String,
}

impl MatrixCombination {
    pub fn get(&self, key: &str) -> Option<&MatrixValue> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Stringified values keyed by dimension name.
    pub fn as_string_map(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// A single job instance produced by matrix expansion.
#[derive(Debug, Clone)]
pub struct ExpandedJob {
    /// The job definition with matrix placeholders resolved and
    /// `MATRIX_*` variables injected. The `matrix` field is cleared.
    pub definition: JobDefinition,
    pub instance_id: String,
    pub display_name: String,
    pub matrix: Option<MatrixCombination>,
    /// Advisory parallelism bound carried from the matrix configuration.
    pub max_parallel: Option<u32>,
}

/// Expand a job definition into its matrix instances.
///
/// The base combinations are the Cartesian product over the dimensions in
/// declaration order. Exclusions remove every combination matching all of
/// their `(key, value)` pairs. Inclusions that match no surviving
/// combination on every specified key synthesise a new combination (missing
/// dimensions take that dimension's first value) appended after the base
/// product.
pub fn expand_matrix(job: &JobDefinition) -> Vec<ExpandedJob> {
    let matrix = match &job.matrix {
        Some(m) if !m.values.is_empty() => m,
        _ => {
            return vec![ExpandedJob {
                definition: job.clone(),
                instance_id: job.name.clone(),
                display_name: job.name.clone(),
                matrix: None,
                max_parallel: job.matrix.as_ref().and_then(|m| m.max_parallel),
            }];
        }
    };

    let mut combinations: Vec<Vec<(String, MatrixValue)>> = vec![Vec::new()];
    for (key, values) in matrix.values.iter() {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combo in &combinations {
            for value in values {
                let mut expanded = combo.clone();
                expanded.push((key.clone(), value.clone()));
                next.push(expanded);
            }
        }
        combinations = next;
    }

    combinations.retain(|combo| {
        !matrix
            .exclude
            .iter()
            .any(|exclusion| matches_selection(combo, exclusion))
    });

    for inclusion in &matrix.include {
        let already_present = combinations
            .iter()
            .any(|combo| matches_selection(combo, inclusion));
        if already_present {
            continue;
        }

        let mut combo: Vec<(String, MatrixValue)> = matrix
            .values
            .iter()
            .map(|(key, values)| {
                let value = inclusion
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| values[0].clone());
                (key.clone(), value)
            })
            .collect();
        // Inclusion keys outside the declared dimensions trail the combo.
        for (key, value) in inclusion.iter() {
            if !combo.iter().any(|(k, _)| k == key) {
                combo.push((key.clone(), value.clone()));
            }
        }
        combinations.push(combo);
    }

    combinations
        .into_iter()
        .enumerate()
        .map(|(index, values)| {
            let name_suffix = values
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            let combination = MatrixCombination {
                index,
                values,
                name_suffix,
            };
            instantiate(job, combination)
        })
        .collect()
}

fn matches_selection(combo: &[(String, MatrixValue)], selection: &MatrixSelection) -> bool {
    selection
        .iter()
        .all(|(key, value)| combo.iter().any(|(k, v)| k == key && v == value))
}

/// Build one instance: resolve `${{ matrix.* }}` placeholders in the job's
/// env values and step text and inject `MATRIX_<KEY>` variables.
fn instantiate(job: &JobDefinition, combination: MatrixCombination) -> ExpandedJob {
    let mut ctx = InterpolationContext::new();
    ctx.matrix = combination.as_string_map();

    let mut definition = job.clone();
    definition.matrix = None;

    for value in definition.env.values_mut() {
        *value = ctx.interpolate(value);
    }
    for (key, value) in &combination.values {
        definition
            .env
            .insert(format!("MATRIX_{}", key.to_uppercase()), value.to_string());
    }

    for step in &mut definition.steps {
        if let StepKind::Run { command } = &mut step.kind {
            *command = ctx.interpolate(command);
        }
        for value in step.env.values_mut() {
            *value = ctx.interpolate(value);
        }
        if let Some(workdir) = &mut step.workdir {
            *workdir = ctx.interpolate(workdir);
        }
    }

    let (instance_id, display_name) = if combination.name_suffix.is_empty() {
        (job.name.clone(), job.name.clone())
    } else {
        (
            format!("{}-{}", job.name, combination.name_suffix),
            format!("{} ({})", job.name, combination.name_suffix),
        )
    };

    let max_parallel = job.matrix.as_ref().and_then(|m| m.max_parallel);
    ExpandedJob {
        definition,
        instance_id,
        display_name,
        matrix: Some(combination),
        max_parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zephyr_core::pipeline::{
        MatrixConfig, MatrixDimensions, RunnerSpec, StepDefinition,
    };

    fn make_job(matrix: Option<MatrixConfig>) -> JobDefinition {
        JobDefinition {
            name: "test".to_string(),
            runner: RunnerSpec {
                image: "ubuntu:24.04".to_string(),
                kind: Default::default(),
            },
            depends_on: vec![],
            env: HashMap::new(),
            steps: vec![StepDefinition {
                id: None,
                name: "run".to_string(),
                kind: StepKind::Run {
                    command: "echo ${{ matrix.os }}".to_string(),
                },
                env: HashMap::new(),
                workdir: None,
                shell: "bash".to_string(),
                condition: None,
                continue_on_error: false,
                timeout_seconds: None,
            }],
            matrix,
        }
    }

    fn dims(entries: Vec<(&str, Vec<MatrixValue>)>) -> MatrixDimensions {
        MatrixDimensions(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn selection(entries: Vec<(&str, MatrixValue)>) -> MatrixSelection {
        MatrixSelection(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let job = make_job(None);
        let expanded = expand_matrix(&job);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].instance_id, "test");
        assert_eq!(expanded[0].display_name, "test");
        assert!(expanded[0].matrix.is_none());
    }

    #[test]
    fn test_cartesian_product_in_declaration_order() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![
                ("os", vec!["ubuntu".into(), "alpine".into()]),
                ("node", vec![18.into(), 20.into()]),
            ]),
            exclude: vec![],
            include: vec![],
            max_parallel: None,
        }));
        let expanded = expand_matrix(&job);
        let names: Vec<&str> = expanded.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test (os=ubuntu, node=18)",
                "test (os=ubuntu, node=20)",
                "test (os=alpine, node=18)",
                "test (os=alpine, node=20)",
            ]
        );
    }

    #[test]
    fn test_exclusion_removes_matching_combination() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![
                ("os", vec!["ubuntu".into(), "alpine".into()]),
                ("node", vec![18.into(), 20.into()]),
            ]),
            exclude: vec![selection(vec![
                ("os", "alpine".into()),
                ("node", 18.into()),
            ])],
            include: vec![],
            max_parallel: None,
        }));
        let expanded = expand_matrix(&job);
        let names: Vec<&str> = expanded.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test (os=ubuntu, node=18)",
                "test (os=ubuntu, node=20)",
                "test (os=alpine, node=20)",
            ]
        );
    }

    #[test]
    fn test_inclusion_synthesises_with_first_values() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![
                ("os", vec!["ubuntu".into(), "alpine".into()]),
                ("node", vec![18.into(), 20.into()]),
            ]),
            exclude: vec![],
            include: vec![selection(vec![("node", 22.into())])],
            max_parallel: None,
        }));
        let expanded = expand_matrix(&job);
        assert_eq!(expanded.len(), 5);
        // Missing dimensions are filled with the first declared value.
        assert_eq!(
            expanded[4].display_name,
            "test (os=ubuntu, node=22)"
        );
    }

    #[test]
    fn test_inclusion_matching_existing_is_noop() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![("os", vec!["ubuntu".into(), "alpine".into()])]),
            exclude: vec![],
            include: vec![selection(vec![("os", "alpine".into())])],
            max_parallel: None,
        }));
        let expanded = expand_matrix(&job);
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn test_cardinality_law() {
        // 2 x 2 product, one applicable exclusion, one new inclusion.
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![
                ("os", vec!["ubuntu".into(), "alpine".into()]),
                ("node", vec![18.into(), 20.into()]),
            ]),
            exclude: vec![selection(vec![("os", "alpine".into()), ("node", 18.into())])],
            include: vec![selection(vec![("os", "debian".into())])],
            max_parallel: None,
        }));
        assert_eq!(expand_matrix(&job).len(), 4 - 1 + 1);
    }

    #[test]
    fn test_interpolation_and_matrix_env() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![("os", vec!["ubuntu".into()])]),
            exclude: vec![],
            include: vec![],
            max_parallel: None,
        }));
        let expanded = expand_matrix(&job);
        let instance = &expanded[0];
        match &instance.definition.steps[0].kind {
            StepKind::Run { command } => assert_eq!(command, "echo ubuntu"),
            _ => panic!("expected run step"),
        }
        assert_eq!(
            instance.definition.env.get("MATRIX_OS").map(String::as_str),
            Some("ubuntu")
        );
    }

    #[test]
    fn test_max_parallel_is_carried() {
        let job = make_job(Some(MatrixConfig {
            values: dims(vec![("os", vec!["ubuntu".into(), "alpine".into()])]),
            exclude: vec![],
            include: vec![],
            max_parallel: Some(1),
        }));
        let expanded = expand_matrix(&job);
        assert!(expanded.iter().all(|e| e.max_parallel == Some(1)));
    }
}
