use std::collections::BTreeMap;
use std::fs::{self};
use std::path::Path;

use aws_sdk_cloudformation::model::Output;

use crate::template::Template;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to write {0}: {1}")]
    IoError(String, std::io::Error),

    #[error("Unable to serialize {0}: {1}")]
    SerializationError(String, String),
}

/// Serialize the template as YAML for `.yaml`/`.yml` locations, JSON otherwise
pub fn render_template(path: &Path, template: &Template) -> Result<String, Error> {
    let is_yaml = matches!(
        path.extension().and_then(|extension| extension.to_str()),
        Some("yaml") | Some("yml")
    );

    let rendered = if is_yaml {
        serde_yaml::to_string(template).map_err(|error| error.to_string())
    } else {
        serde_json::to_string_pretty(template).map_err(|error| error.to_string())
    };

    return rendered.map_err(|error| Error::SerializationError(path.display().to_string(), error));
}

pub fn write_template(path: &Path, template: &Template) -> Result<(), Error> {
    let contents = render_template(path, template)?;
    write_file(path, &contents)
}

/// Deployed stack outputs as a flat `{"OutputKey": "OutputValue"}` JSON object
pub fn write_outputs(path: &Path, outputs: &[Output]) -> Result<(), Error> {
    let contents = outputs.iter().fold(BTreeMap::new(), |mut acc, output| {
        if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
            acc.insert(key, value);
        }

        acc
    });

    let file_contents = serde_json::to_string_pretty(&contents)
        .map_err(|error| Error::SerializationError(path.display().to_string(), error.to_string()))?;
    write_file(path, &file_contents)
}

fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    let io_error = |error| Error::IoError(path.display().to_string(), error);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    fs::write(path, contents).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::template::Resource;

    fn template() -> Template {
        let mut template = Template::default();
        template.resources.insert(
            "Queue".to_string(),
            Resource::new("AWS::SQS::Queue", json!({"VisibilityTimeout": 60})).unwrap(),
        );
        template
    }

    #[test]
    fn writes_json_template_into_new_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("Stack.template.json");

        write_template(&path, &template()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: Template = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, template());
    }

    #[test]
    fn writes_yaml_template() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Stack.template.yml");

        write_template(&path, &template()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Type: AWS::SQS::Queue"));
        assert!(contents.contains("AWSTemplateFormatVersion: 2010-09-09")
            || contents.contains("AWSTemplateFormatVersion: '2010-09-09'"));
    }

    #[test]
    fn writes_outputs_as_flat_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        let outputs = vec![
            Output::builder()
                .output_key("LoadBalancerDNS")
                .output_value("lb-123.eu-west-1.elb.amazonaws.com")
                .build(),
            Output::builder().output_key("Dangling").build(),
        ];

        write_outputs(&path, &outputs).unwrap();

        let contents: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            contents,
            json!({"LoadBalancerDNS": "lb-123.eu-west-1.elb.amazonaws.com"})
        );
    }
}
