use super::handlers::{audit, csrf, health, login, session, sessions};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";
pub const SWAGGER_UI_PATH: &str = "/docs";

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Every documented route. Register endpoints here so they are served and described.
pub(crate) fn api_router() -> OpenApiRouter {
    OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(csrf::csrf_token))
        .routes(routes!(login::login))
        .routes(routes!(session::session, session::logout))
        .routes(routes!(sessions::revoke))
        .routes(routes!(audit::events))
}

fn tags() -> Vec<Tag> {
    [
        ("auth", "Admin login"),
        ("session", "Session lifecycle and CSRF tokens"),
        ("audit", "Security audit trail"),
        ("health", "Liveness and store connectivity"),
    ]
    .into_iter()
    .map(|(name, description)| {
        let mut tag = Tag::new(name);
        tag.description = Some(description.to_string());
        tag
    })
    .collect()
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    // Cargo authors are `;` separated, each "Name <email>".
    info.contact = env!("CARGO_PKG_AUTHORS")
        .split(';')
        .next()
        .and_then(author_contact);
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        let mut license = License::new(spdx);
        license.identifier = Some(spdx.to_string());
        license
    });

    OpenApiBuilder::new().info(info).tags(Some(tags())).build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn author_contact(author: &str) -> Option<Contact> {
    let (name, email) = match author.split_once('<') {
        Some((name, rest)) => (non_empty(name), non_empty(rest.trim_end().trim_end_matches('>'))),
        None => (non_empty(author), None),
    };
    if name.is_none() && email.is_none() {
        return None;
    }
    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}
