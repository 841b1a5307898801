//! Multipart intake for `POST /upload`.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use bytes::BytesMut;

use crate::errors::AppError;
use crate::registry::{RegistryError, UploadedFile};

pub const CV_FIELD: &str = "cv";
pub const PROJECT_FIELD: &str = "project";

/// The two file parts of an upload.
#[derive(Debug)]
pub struct UploadPair {
    pub cv: UploadedFile,
    pub project: UploadedFile,
}

/// Reads both parts, enforcing `max_bytes` per part while streaming.
pub async fn read_upload_pair(
    multipart: &mut Multipart,
    max_bytes: usize,
) -> Result<UploadPair, AppError> {
    let mut cv = None;
    let mut project = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let slot = match name.as_str() {
            CV_FIELD => &mut cv,
            PROJECT_FIELD => &mut project,
            other => {
                return Err(AppError::Validation(format!(
                    "Unexpected field '{other}'; expected '{CV_FIELD}' and '{PROJECT_FIELD}'"
                )))
            }
        };
        if slot.is_some() {
            return Err(AppError::Validation(format!(
                "Field '{name}' may only be sent once"
            )));
        }
        *slot = Some(read_file(field, name, max_bytes).await?);
    }

    match (cv, project) {
        (Some(cv), Some(project)) => Ok(UploadPair { cv, project }),
        _ => Err(AppError::Validation(
            "Both CV and project files are required".to_string(),
        )),
    }
}

async fn read_file(
    mut field: Field<'_>,
    name: String,
    max_bytes: usize,
) -> Result<UploadedFile, AppError> {
    let filename = field
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{name}.pdf"));
    let content_type = field.content_type().map(str::to_string);

    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if buf.len() + chunk.len() > max_bytes {
            return Err(RegistryError::TooLarge {
                field: name,
                limit: max_bytes,
            }
            .into());
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(UploadedFile {
        field: name,
        filename,
        content_type,
        bytes: buf.freeze(),
    })
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::FileTooLarge("Upload exceeds the maximum request size".to_string())
    } else {
        AppError::Validation(format!("Malformed multipart body: {}", err.body_text()))
    }
}
