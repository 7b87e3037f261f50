use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, path::PathBuf};
use validator::{Validate, ValidationError};

use crate::stacks::{validate_stack_kind, EcsPatternProps, LoadBalancerProps, StackKind};

pub const DEFAULT_PATH: &str = "./stacks.yaml";

/// Directory templates land in unless the config says otherwise
pub const DEFAULT_OUT_DIR: &str = "cdk.out";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConfigFile {
    pub location: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConfigEntry {
    #[validate(required, custom = "validate_stack_name")]
    pub stack_name: Option<String>,

    pub region: Option<String>,

    #[validate(custom = "validate_template_file")]
    pub template: ConfigFile,

    #[validate(custom = "validate_outputs_file")]
    pub outputs: Option<ConfigFile>,

    #[validate(custom = "validate_stack_kind")]
    pub stack: StackKind,
}

impl ConfigEntry {
    pub fn new(stack_name: &str, stack: StackKind) -> Self {
        ConfigEntry {
            stack_name: Some(stack_name.to_string()),
            region: None,
            template: ConfigFile {
                location: PathBuf::from(DEFAULT_OUT_DIR)
                    .join(format!("{stack_name}.template.json")),
            },
            outputs: None,
            stack,
        }
    }

    /// Validation guarantees the name is present
    pub fn name(&self) -> &str {
        self.stack_name.as_deref().unwrap_or_default()
    }
}

pub type Config = Vec<ConfigEntry>;

/// The two stacks this tool knows, with their stock values
pub fn default_config() -> Config {
    vec![
        ConfigEntry::new(
            "LoadBalancerStack",
            StackKind::LoadBalancer(LoadBalancerProps::default()),
        ),
        ConfigEntry::new(
            "sample-ecs-pattern-ec2-alb",
            StackKind::EcsPattern(EcsPatternProps::default()),
        ),
    ]
}

pub fn parse(path: &Path) -> Result<Config, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    for config_entry in &config {
        match config_entry.validate() {
            Ok(_) => (),
            Err(error) => return Err(Error::ValidationError(error.to_string())),
        }
    }

    let mut names: Vec<&str> = config.iter().map(ConfigEntry::name).collect();
    names.sort_unstable();
    if let Some(duplicate) = names.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(Error::ValidationError(format!(
            "stack {} is configured more than once",
            duplicate[0]
        )));
    }

    return Ok(config);
}

/// CloudFormation stack names: a letter, then letters, digits and hyphens
fn validate_stack_name(stack_name: &str) -> Result<(), ValidationError> {
    let mut chars = stack_name.chars();
    let starts_with_letter = chars
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);

    if !starts_with_letter
        || stack_name.len() > 128
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ValidationError::new(
            "The stack name has to start with a letter and contain only letters, digits and hyphens",
        ));
    }

    return Ok(());
}

fn validate_template_file(template_file: &ConfigFile) -> Result<(), ValidationError> {
    let file_extension = match template_file.location.extension() {
        Some(extension) => extension,
        None => {
            return Err(ValidationError::new(
                "Unable to parse the extension of the template file location",
            ))
        }
    };
    if file_extension != "json" && file_extension != "yaml" && file_extension != "yml" {
        return Err(ValidationError::new(
            "The template file location has to end with `.json`, `.yaml` or `.yml`",
        ));
    }

    return Ok(());
}

fn validate_outputs_file(outputs_file: &ConfigFile) -> Result<(), ValidationError> {
    let file_extension = match outputs_file.location.extension() {
        Some(extension) => extension,
        None => {
            return Err(ValidationError::new(
                "Unable to parse the extension of the outputs file location",
            ))
        }
    };
    if file_extension != "json" {
        return Err(ValidationError::new(
            "The outputs file location has to end with `.json`",
        ));
    }

    return Ok(());
}
