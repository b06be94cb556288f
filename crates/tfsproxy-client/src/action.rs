//! Action requests and outcomes
//!
//! The front end hands the engine an [`ActionRequest`] and gets back exactly
//! one [`ActionOutcome`]: a status code, a content type hint and a body,
//! plus the decoded details a front end may want to render itself.

use bytes::Bytes;
use serde::Serialize;
use tfsproxy_common::{ActionKind, Error, FsVersion, StatusCode, UnlinkType};
use tfsproxy_proto::data::RawFileInfo;
use tfsproxy_proto::meta::LsEntry;

use crate::operation::State;
use crate::planner::Hole;

pub const CONTENT_BINARY: &str = "application/octet-stream";
pub const CONTENT_JSON: &str = "application/json";
pub const CONTENT_TEXT: &str = "text/plain";

/// One front end request
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub version: FsVersion,
    /// Raw file name (`T...` or `L...`)
    pub file_name: Option<String>,
    pub suffix: Option<String>,
    /// Named file or directory path
    pub path: Option<String>,
    /// Destination of a move
    pub new_path: Option<String>,
    pub user_id: u64,
    pub offset: u64,
    /// `None` reads to the end of the file
    pub length: Option<u64>,
    pub body: Bytes,
    /// Store a raw write as a large file regardless of its size
    pub large_file: bool,
    /// Return raw names without the suffix bits
    pub simple_name: bool,
    pub unlink_type: UnlinkType,
    /// Create missing parent directories
    pub recursive: bool,
    /// Read or stat deleted and concealed files too
    pub force: bool,
}

impl ActionRequest {
    fn new(kind: ActionKind, version: FsVersion) -> Self {
        Self {
            kind,
            version,
            file_name: None,
            suffix: None,
            path: None,
            new_path: None,
            user_id: 0,
            offset: 0,
            length: None,
            body: Bytes::new(),
            large_file: false,
            simple_name: false,
            unlink_type: UnlinkType::Delete,
            recursive: false,
            force: false,
        }
    }

    /// Raw file action; reads, stats and removes also need [`Self::file_name`]
    #[must_use]
    pub fn raw(kind: ActionKind) -> Self {
        Self::new(kind, FsVersion::Raw)
    }

    /// Named file action on `path` owned by `user_id`
    #[must_use]
    pub fn custom(kind: ActionKind, user_id: u64, path: impl Into<String>) -> Self {
        let mut req = Self::new(kind, FsVersion::Custom);
        req.user_id = user_id;
        req.path = Some(path.into());
        req
    }

    #[must_use]
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    #[must_use]
    pub fn new_path(mut self, path: impl Into<String>) -> Self {
        self.new_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn range(mut self, offset: u64, length: Option<u64>) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn large(mut self) -> Self {
        self.large_file = true;
        self
    }

    #[must_use]
    pub const fn simple(mut self) -> Self {
        self.simple_name = true;
        self
    }

    #[must_use]
    pub const fn unlink(mut self, unlink_type: UnlinkType) -> Self {
        self.unlink_type = unlink_type;
        self
    }

    #[must_use]
    pub const fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    #[must_use]
    pub const fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// The single terminal answer to a request
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
    /// Name of a written raw file
    pub file_name: Option<String>,
    pub file_info: Option<RawFileInfo>,
    pub entries: Vec<LsEntry>,
    /// Zero-filled gaps of a named file read
    pub holes: Vec<Hole>,
    /// Every state the request went through
    pub history: Vec<State>,
    pub error: Option<String>,
}

impl ActionOutcome {
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            content_type: CONTENT_TEXT,
            body: Bytes::new(),
            file_name: None,
            file_info: None,
            entries: Vec::new(),
            holes: Vec::new(),
            history: Vec::new(),
            error: None,
        }
    }

    /// 200 carrying file data
    #[must_use]
    pub fn data(body: Bytes) -> Self {
        let mut outcome = Self::with_status(200);
        outcome.content_type = CONTENT_BINARY;
        outcome.body = body;
        outcome
    }

    #[must_use]
    pub fn json(status: u16, value: &impl Serialize) -> Self {
        let mut outcome = Self::with_status(status);
        outcome.content_type = CONTENT_JSON;
        // serializing plain maps and structs cannot fail
        outcome.body = serde_json::to_vec(value).map(Bytes::from).unwrap_or_default();
        outcome
    }

    /// Map a failed request to its externally visible status
    #[must_use]
    pub fn failure(kind: ActionKind, err: &Error) -> Self {
        let status = match (kind, err.status_code()) {
            (ActionKind::CreateDir | ActionKind::CreateFile, Some(StatusCode::TARGET_EXIST)) => 409,
            _ => err.http_status_code(),
        };
        let mut outcome = Self::with_status(status);
        outcome.error = Some(err.to_string());
        outcome
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Bytes handed to the client
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.body.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let req = ActionRequest::raw(ActionKind::ReadFile)
            .file_name("T1abc")
            .suffix(".jpg")
            .range(10, Some(20))
            .force();
        assert_eq!(req.version, FsVersion::Raw);
        assert_eq!(req.file_name.as_deref(), Some("T1abc"));
        assert_eq!((req.offset, req.length), (10, Some(20)));
        assert!(req.force);

        let req = ActionRequest::custom(ActionKind::MoveDir, 9, "/a").new_path("/b");
        assert_eq!(req.user_id, 9);
        assert_eq!(req.new_path.as_deref(), Some("/b"));
    }

    #[test]
    fn test_failure_status() {
        let exists = Error::status(StatusCode::TARGET_EXIST, "exists");
        assert_eq!(ActionOutcome::failure(ActionKind::CreateDir, &exists).status, 409);
        assert_eq!(ActionOutcome::failure(ActionKind::ListDir, &exists).status, 404);
        let abort = ActionOutcome::failure(ActionKind::WriteFile, &Error::ClientAbort);
        assert_eq!(abort.status, 499);
        assert!(!abort.is_success());
    }

    #[test]
    fn test_json_outcome() {
        let outcome = ActionOutcome::json(200, &json!({"APP_ID": 7}));
        assert_eq!(outcome.content_type, CONTENT_JSON);
        assert_eq!(&outcome.body[..], br#"{"APP_ID":7}"#);
        assert_eq!(outcome.byte_count(), 12);
    }
}
