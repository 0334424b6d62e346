use serde::Serialize;

use crate::config::{FeatureFlags, LanguageConfig};
use crate::record::SubmissionRequest;

/// One field-level problem with a submission request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Checks a request against the language catalog and feature flags before it
/// enters the pipeline. All problems are collected so the caller can report
/// every one of them at once; nothing is persisted here.
pub fn validate(
    req: &SubmissionRequest,
    languages: &[LanguageConfig],
    features: &FeatureFlags,
    grading: bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    let language = languages.iter().find(|l| l.id == req.language_id);
    match language {
        None => violations.push(Violation::new("language_id", "language does not exist")),
        Some(l) if l.is_archived => {
            violations.push(Violation::new("language_id", "language is archived"));
        }
        _ => {}
    }

    if let Some(language) = language {
        if language.is_project {
            if !req.source_code.is_empty() {
                violations.push(Violation::new(
                    "source_code",
                    "must be empty for project submissions",
                ));
            }
            if req
                .additional_files
                .as_deref()
                .is_none_or(|files| files.is_empty())
            {
                violations.push(Violation::new(
                    "additional_files",
                    "required for project submissions",
                ));
            }
        } else if req.source_code.is_empty() {
            violations.push(Violation::new("source_code", "can't be blank"));
        }
    }

    if req.compiler_options.as_deref().is_some_and(|s| !s.is_empty()) {
        if !features.enable_compiler_options {
            violations.push(Violation::new(
                "compiler_options",
                "compiler options are not enabled",
            ));
        } else if let Some(language) = language {
            if !language.is_compiled() {
                violations.push(Violation::new(
                    "compiler_options",
                    "compiler options are only allowed for compiled languages",
                ));
            } else if !features
                .compiler_options_allowed_languages
                .iter()
                .any(|prefix| language.name.starts_with(prefix.as_str()))
            {
                violations.push(Violation::new(
                    "compiler_options",
                    format!("compiler options are not allowed for {}", language.name),
                ));
            }
        }
    }

    if req.command_line_arguments.is_some() && !features.enable_command_line_arguments {
        violations.push(Violation::new(
            "command_line_arguments",
            "command-line arguments are not enabled",
        ));
    }

    if req.callback_url.as_deref().is_some_and(|s| !s.is_empty()) && !features.enable_callbacks {
        violations.push(Violation::new("callback_url", "callbacks are not enabled"));
    }

    if req.additional_files.is_some() && !features.enable_additional_files {
        violations.push(Violation::new(
            "additional_files",
            "additional files are not enabled",
        ));
    }

    if req.enable_network == Some(true) && !features.enable_network {
        violations.push(Violation::new(
            "enable_network",
            "network access is not enabled",
        ));
    }

    if grading && req.test_cases.is_empty() {
        violations.push(Violation::new("test_cases", "can't be empty"));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn languages() -> Vec<LanguageConfig> {
        serde_json::from_str(
            r#"[
                {
                    "id": 71,
                    "name": "Python (3.12)",
                    "source_file": "main.py",
                    "run_cmd": ["python3", "%SOURCE%"]
                },
                {
                    "id": 50,
                    "name": "C (GCC 14)",
                    "source_file": "main.c",
                    "compile_cmd": ["gcc", "%SOURCE%", "-o", "%EXECUTABLE%"],
                    "run_cmd": ["./%EXECUTABLE%"]
                },
                {
                    "id": 45,
                    "name": "Assembly (NASM)",
                    "source_file": "main.asm",
                    "compile_cmd": ["nasm", "%SOURCE%"],
                    "run_cmd": ["./%EXECUTABLE%"]
                },
                {
                    "id": 84,
                    "name": "Fortran (old)",
                    "is_archived": true,
                    "source_file": "main.f90",
                    "run_cmd": ["./%EXECUTABLE%"]
                },
                {
                    "id": 89,
                    "name": "Multi-file program",
                    "is_project": true,
                    "source_file": "main",
                    "run_cmd": ["./run"]
                }
            ]"#,
        )
        .unwrap()
    }

    fn request(json: &str) -> SubmissionRequest {
        serde_json::from_str(json).unwrap()
    }

    fn fields(violations: &[Violation]) -> Vec<&'static str> {
        violations.iter().map(|v| v.field).collect()
    }

    #[test]
    fn test_valid_request_passes() {
        let req = request(r#"{ "source_code": "print(1)", "language_id": 71 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(violations, vec![]);
    }

    #[test]
    fn test_unknown_and_archived_language() {
        let req = request(r#"{ "source_code": "x", "language_id": 999 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(fields(&violations), vec!["language_id"]);

        let req = request(r#"{ "source_code": "x", "language_id": 84 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(fields(&violations), vec!["language_id"]);
    }

    #[test]
    fn test_blank_source_rejected() {
        let req = request(r#"{ "language_id": 71 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(fields(&violations), vec!["source_code"]);
    }

    #[test]
    fn test_project_submission_rules() {
        // Non-empty source on a project language is rejected
        let req = request(
            r#"{ "source_code": "x", "language_id": 89, "additional_files": "UEsDBA==" }"#,
        );
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(fields(&violations), vec!["source_code"]);

        // Empty source with no archive is rejected
        let req = request(r#"{ "language_id": 89 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(fields(&violations), vec!["additional_files"]);

        // Empty source with an archive is accepted
        let req = request(r#"{ "language_id": 89, "additional_files": "UEsDBA==" }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), false);
        assert_eq!(violations, vec![]);
    }

    #[test]
    fn test_compiler_options_gating() {
        let mut features = FeatureFlags::default();

        // Interpreted language
        let req = request(
            r#"{ "source_code": "x", "language_id": 71, "compiler_options": "-O2" }"#,
        );
        let violations = validate(&req, &languages(), &features, false);
        assert_eq!(fields(&violations), vec!["compiler_options"]);

        // Compiled language on the allow-list
        let req = request(
            r#"{ "source_code": "x", "language_id": 50, "compiler_options": "-O2" }"#,
        );
        assert_eq!(validate(&req, &languages(), &features, false), vec![]);

        // Compiled language not on the allow-list
        let req = request(
            r#"{ "source_code": "x", "language_id": 45, "compiler_options": "-O2" }"#,
        );
        let violations = validate(&req, &languages(), &features, false);
        assert_eq!(fields(&violations), vec!["compiler_options"]);

        // Feature disabled altogether
        features.enable_compiler_options = false;
        let req = request(
            r#"{ "source_code": "x", "language_id": 50, "compiler_options": "-O2" }"#,
        );
        let violations = validate(&req, &languages(), &features, false);
        assert_eq!(fields(&violations), vec!["compiler_options"]);
    }

    #[test]
    fn test_feature_flag_gating_collects_all() {
        let features = FeatureFlags {
            enable_command_line_arguments: false,
            enable_callbacks: false,
            enable_additional_files: false,
            enable_network: false,
            ..FeatureFlags::default()
        };
        let req = request(
            r#"{
                "source_code": "x",
                "language_id": 71,
                "command_line_arguments": "-v",
                "callback_url": "http://example.com/cb",
                "additional_files": "UEsDBA==",
                "enable_network": true
            }"#,
        );
        let violations = validate(&req, &languages(), &features, false);
        assert_eq!(
            fields(&violations),
            vec![
                "command_line_arguments",
                "callback_url",
                "additional_files",
                "enable_network"
            ]
        );
    }

    #[test]
    fn test_grading_requires_test_cases() {
        let req = request(r#"{ "source_code": "x", "language_id": 71 }"#);
        let violations = validate(&req, &languages(), &FeatureFlags::default(), true);
        assert_eq!(fields(&violations), vec!["test_cases"]);
    }
}
