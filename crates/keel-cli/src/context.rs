//! Run context assembled from flags and an optional context file.

use clap::Args;
use keel_core::predicate::{RunContext, Value};
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub struct ContextArgs {
    /// YAML or JSON file with context fields (`build.branch: main`)
    #[arg(long = "context", value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Branch being built
    #[arg(long)]
    pub branch: Option<String>,

    /// Tag being built
    #[arg(long)]
    pub tag: Option<String>,

    /// Commit being built
    #[arg(long)]
    pub commit: Option<String>,

    /// Pull request number
    #[arg(long)]
    pub pull_request: Option<i64>,

    /// The pull request comes from a fork
    #[arg(long, requires = "pull_request")]
    pub fork: bool,

    /// Extra field as `name=value`; `true`, `false` and integers are typed
    #[arg(long = "set", value_name = "FIELD=VALUE")]
    pub fields: Vec<String>,
}

impl ContextArgs {
    /// Build the context. Flags override fields from the file; `build.source`
    /// defaults to `local` when the file does not set it.
    pub fn build(&self) -> Result<RunContext, Box<dyn std::error::Error>> {
        let mut context = match &self.file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&content)?
            }
            None => RunContext::new(),
        };

        if context.get("build.source") == &Value::Null {
            context.set("build.source", "local");
        }
        if let Some(branch) = &self.branch {
            context.set("build.branch", branch.as_str());
        }
        if let Some(tag) = &self.tag {
            context.set("build.tag", tag.as_str());
        }
        if let Some(commit) = &self.commit {
            context.set("build.commit", commit.as_str());
        }
        if let Some(id) = self.pull_request {
            context.set("build.pull_request.id", id);
            context.set("build.pull_request.repository.fork", self.fork);
        }
        for field in &self.fields {
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| format!("Invalid field `{}`, expected FIELD=VALUE", field))?;
            context.set(name.trim(), typed(value.trim()));
        }
        Ok(context)
    }
}

fn typed(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "" | "null" => Value::Null,
        _ => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_build_pull_request_context() {
        let args = ContextArgs {
            pull_request: Some(42),
            fork: true,
            branch: Some("feature".to_string()),
            fields: vec!["build.number=7".to_string(), "build.pull_request.draft=false".to_string()],
            ..Default::default()
        };
        let context = args.build().unwrap();

        assert_eq!(context.get("build.pull_request.id"), &Value::Int(42));
        assert_eq!(context.get("build.pull_request.repository.fork"), &Value::Bool(true));
        assert_eq!(context.get("build.branch"), &Value::Str("feature".to_string()));
        assert_eq!(context.get("build.number"), &Value::Int(7));
        assert_eq!(context.get("build.pull_request.draft"), &Value::Bool(false));
        assert_eq!(context.get("build.tag"), &Value::Null);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "build.branch: main\nbuild.message: \"fix: things\"").unwrap();

        let args = ContextArgs {
            file: Some(file.path().to_path_buf()),
            branch: Some("release".to_string()),
            ..Default::default()
        };
        let context = args.build().unwrap();

        assert_eq!(context.get("build.branch"), &Value::Str("release".to_string()));
        assert_eq!(context.get("build.message"), &Value::Str("fix: things".to_string()));
        assert_eq!(context.get("build.source"), &Value::Str("local".to_string()));
    }

    #[test]
    fn test_file_source_is_kept() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "build.source: schedule").unwrap();

        let args = ContextArgs {
            file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let context = args.build().unwrap();

        assert_eq!(context.get("build.source"), &Value::Str("schedule".to_string()));
    }

    #[test]
    fn test_malformed_field_is_rejected() {
        let args = ContextArgs {
            fields: vec!["build.branch".to_string()],
            ..Default::default()
        };
        assert!(args.build().is_err());
    }
}
