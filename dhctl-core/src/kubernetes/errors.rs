use kube::error::ErrorResponse;

/// Message fragment the API server returns when an update lost an
/// optimistic-concurrency race.
pub const OBJECT_MODIFIED_HINT: &str = "the object has been modified";

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(
        error,
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists"
    )
}

pub fn is_object_modified(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => response.message.contains(OBJECT_MODIFIED_HINT),
        _ => false,
    }
}

/// Builds an API error the way the server reports it.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: message.into(),
        reason: reason.to_owned(),
        code,
    })
}

pub fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

pub fn already_exists(kind: &str, name: &str) -> kube::Error {
    api_error(409, "AlreadyExists", format!("{kind} \"{name}\" already exists"))
}

pub fn object_modified(kind: &str, name: &str) -> kube::Error {
    api_error(
        409,
        "Conflict",
        format!(
            "Operation cannot be fulfilled on {kind} \"{name}\": {OBJECT_MODIFIED_HINT}; \
            please apply your changes to the latest version and try again"
        ),
    )
}
