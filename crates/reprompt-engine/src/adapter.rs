//! Chat formatting for predictor calls.
//!
//! Every field is framed by a `[[ ## name ## ]]` marker line. The system
//! message describes the fields and the instructions, each demo becomes a
//! user/assistant pair, and the live inputs form the final user message.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use reprompt_contracts::dataset::{FieldValue, Prediction};
use reprompt_contracts::program::{Demo, Predictor};
use reprompt_contracts::signatures::{FieldKind, FieldSpec, Signature, REASONING_FIELD};
use thiserror::Error;

use crate::lm::{ChatMessage, ChatRequest, ContentPart};
use crate::payload::ImagePayload;

const COMPLETED_MARKER: &str = "completed";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing input field '{field}'")]
    MissingInput { field: String },

    #[error("failed reading image for field '{field}' ({})", path.display())]
    ReadImage {
        field: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("completion is missing output field '{field}'")]
    MissingField { field: String },
}

pub fn marker(name: &str) -> String {
    format!("[[ ## {name} ## ]]")
}

/// Builds the chat request for one predictor call.
pub fn format_request(
    predictor: &Predictor,
    inputs: &IndexMap<String, FieldValue>,
    model: &str,
    max_tokens: Option<u64>,
) -> Result<ChatRequest, AdapterError> {
    let signature = predictor.kind.effective_signature(&predictor.signature);
    let mut messages = vec![ChatMessage::system(system_prompt(
        &signature,
        &predictor.instructions,
    ))];

    for demo in &predictor.demos {
        let Some(user) = demo_user_message(&signature, demo)? else {
            continue;
        };
        messages.push(user);
        messages.push(ChatMessage::assistant(demo_assistant_text(&signature, demo)));
    }

    let mut content = Vec::new();
    for field in &signature.inputs {
        let value = inputs
            .get(&field.name)
            .ok_or_else(|| AdapterError::MissingInput {
                field: field.name.clone(),
            })?;
        push_field(&mut content, field, value)?;
    }
    content.push(ContentPart::Text(output_reminder(&signature)));
    messages.push(ChatMessage::user(merge_text(content)));

    Ok(ChatRequest::new(model, messages).with_max_tokens(max_tokens))
}

fn system_prompt(signature: &Signature, instructions: &str) -> String {
    let mut out = String::from("Your input fields are:\n");
    describe_fields(&mut out, &signature.inputs);
    out.push_str("Your output fields are:\n");
    describe_fields(&mut out, &signature.outputs);
    out.push_str(
        "All interactions will be structured in the following way, with the appropriate values filled in.\n\n",
    );
    for field in signature.inputs.iter().chain(signature.outputs.iter()) {
        out.push_str(&format!("{}\n{{{}}}\n\n", marker(&field.name), field.name));
    }
    out.push_str(&format!("{}\n", marker(COMPLETED_MARKER)));
    out.push_str(&format!(
        "In adhering to this structure, your objective is: \n        {}",
        instructions.trim()
    ));
    out
}

fn describe_fields(out: &mut String, fields: &[FieldSpec]) {
    for (idx, field) in fields.iter().enumerate() {
        out.push_str(&format!("{}. `{}` ({})", idx + 1, field.name, field.kind.label()));
        if !field.description.is_empty() {
            out.push_str(&format!(": {}", field.description));
        }
        out.push('\n');
    }
}

fn output_reminder(signature: &Signature) -> String {
    let fields: Vec<String> = signature
        .outputs
        .iter()
        .map(|field| format!("`{}`", marker(&field.name)))
        .collect();
    format!(
        "Respond with the corresponding output fields, starting with the field {}, and then ending with the marker for `{}`.",
        fields.join(", then "),
        marker(COMPLETED_MARKER)
    )
}

/// Demos lacking an input field are skipped.
fn demo_user_message(signature: &Signature, demo: &Demo) -> Result<Option<ChatMessage>, AdapterError> {
    let mut content = Vec::new();
    for field in &signature.inputs {
        let Some(value) = demo.get(&field.name) else {
            return Ok(None);
        };
        let value = match field.kind {
            FieldKind::Text => FieldValue::Text(value.clone()),
            FieldKind::Image => FieldValue::Image(PathBuf::from(value)),
        };
        push_field(&mut content, field, &value)?;
    }
    Ok(Some(ChatMessage::user(merge_text(content))))
}

fn demo_assistant_text(signature: &Signature, demo: &Demo) -> String {
    let mut out = String::new();
    for field in &signature.outputs {
        if let Some(value) = demo.get(&field.name) {
            out.push_str(&format!("{}\n{}\n\n", marker(&field.name), value.trim()));
        }
    }
    out.push_str(&marker(COMPLETED_MARKER));
    out
}

fn push_field(
    content: &mut Vec<ContentPart>,
    field: &FieldSpec,
    value: &FieldValue,
) -> Result<(), AdapterError> {
    content.push(ContentPart::Text(format!("{}\n", marker(&field.name))));
    match (field.kind, value) {
        (FieldKind::Text, FieldValue::Text(text)) => {
            content.push(ContentPart::Text(format!("{}\n\n", text)));
        }
        (FieldKind::Text, FieldValue::Image(path)) => {
            content.push(ContentPart::Text(format!("{}\n\n", path.display())));
        }
        (FieldKind::Image, FieldValue::Image(path)) => {
            content.push(ContentPart::ImageUrl(read_image(&field.name, path)?));
            content.push(ContentPart::Text("\n\n".to_string()));
        }
        (FieldKind::Image, FieldValue::Text(path)) => {
            content.push(ContentPart::ImageUrl(read_image(&field.name, Path::new(path))?));
            content.push(ContentPart::Text("\n\n".to_string()));
        }
    }
    Ok(())
}

fn read_image(field: &str, path: &Path) -> Result<String, AdapterError> {
    ImagePayload::from_path(path)
        .map(|payload| payload.data_uri())
        .map_err(|source| AdapterError::ReadImage {
            field: field.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

/// Joins adjacent text parts so text-only messages stay a single string.
fn merge_text(parts: Vec<ContentPart>) -> Vec<ContentPart> {
    let mut merged: Vec<ContentPart> = Vec::with_capacity(parts.len());
    for part in parts {
        if let ContentPart::Text(text) = &part {
            if let Some(ContentPart::Text(previous)) = merged.last_mut() {
                previous.push_str(text);
                continue;
            }
        }
        merged.push(part);
    }
    merged
}

/// Splits a completion into the signature's output fields.
pub fn parse_completion(signature: &Signature, completion: &str) -> Result<Prediction, AdapterError> {
    let mut sections: IndexMap<String, Vec<&str>> = IndexMap::new();
    let mut current: Option<String> = None;
    for line in completion.lines() {
        if let Some(name) = parse_marker(line) {
            current = Some(name.to_string());
            sections.entry(name.to_string()).or_default();
            continue;
        }
        if let Some(name) = current.as_ref() {
            if let Some(lines) = sections.get_mut(name) {
                lines.push(line);
            }
        }
    }

    if sections.is_empty() {
        return bare_completion(signature, completion);
    }

    let mut prediction = Prediction::new();
    for field in &signature.outputs {
        let Some(lines) = sections.get(&field.name) else {
            return Err(AdapterError::MissingField {
                field: field.name.clone(),
            });
        };
        prediction = prediction.with(&field.name, lines.join("\n").trim());
    }
    Ok(prediction)
}

fn bare_completion(signature: &Signature, completion: &str) -> Result<Prediction, AdapterError> {
    let answers: Vec<&FieldSpec> = signature
        .outputs
        .iter()
        .filter(|field| field.name != REASONING_FIELD)
        .collect();
    match answers.as_slice() {
        [only] => {
            let mut prediction = Prediction::new();
            if signature.field(REASONING_FIELD).is_some() {
                prediction = prediction.with(REASONING_FIELD, "");
            }
            Ok(prediction.with(&only.name, completion.trim()))
        }
        _ => Err(AdapterError::MissingField {
            field: signature
                .outputs
                .first()
                .map(|field| field.name.clone())
                .unwrap_or_default(),
        }),
    }
}

fn parse_marker(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("[[ ## ")
        .and_then(|rest| rest.strip_suffix(" ## ]]"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}
