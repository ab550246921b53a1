//! Form access for handlers.
//!
//! `application/x-www-form-urlencoded` bodies are decoded with `serde_urlencoded`,
//! `multipart/form-data` bodies with `multer`. Body fields take precedence over query
//! fields of the same name.

use crate::context::Context;
use crate::error::{Result, StatusError};
use bytes::Bytes;
use http::HeaderMap;
use std::convert::Infallible;

/// An uploaded file of a multipart form.
#[derive(Debug, Clone)]
pub struct FormFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub(crate) struct Form {
    values: Vec<(String, String)>,
    files: Vec<FormFile>,
}

impl Form {
    pub(crate) async fn parse(headers: &HeaderMap, query: &[(String, String)], body: Bytes) -> Result<Self> {
        let content_type = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();

        let mut form = Self::default();
        if content_type.starts_with(mime::APPLICATION_WWW_FORM_URLENCODED.as_ref()) {
            form.values = serde_urlencoded::from_bytes(&body).map_err(StatusError::bad_request)?;
        } else if content_type.starts_with(mime::MULTIPART_FORM_DATA.as_ref()) {
            form.parse_multipart(content_type, body).await?;
        }
        form.values.extend_from_slice(query);
        Ok(form)
    }

    async fn parse_multipart(&mut self, content_type: &str, body: Bytes) -> Result<()> {
        let boundary = multer::parse_boundary(content_type).map_err(StatusError::bad_request)?;
        let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        while let Some(field) = multipart.next_field().await.map_err(StatusError::bad_request)? {
            let name = field.name().unwrap_or_default().to_owned();
            match field.file_name().map(str::to_owned) {
                Some(file_name) => {
                    let content_type = field.content_type().map(ToString::to_string);
                    let data = field.bytes().await.map_err(StatusError::bad_request)?;
                    self.files.push(FormFile { field: name, file_name, content_type, data });
                }
                None => {
                    let value = field.text().await.map_err(StatusError::bad_request)?;
                    self.values.push((name, value));
                }
            }
        }
        Ok(())
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn file(&self, key: &str) -> Option<&FormFile> {
        self.files.iter().find(|f| f.field == key)
    }
}

impl Context {
    /// Returns the first form value for `key`.
    ///
    /// A body that cannot be parsed yields `StatusError{BadRequest}`.
    pub async fn form_value(&self, key: &str) -> Result<Option<String>> {
        let form = self.form().await?;
        Ok(form.value(key).map(str::to_owned))
    }

    /// Returns the first uploaded file of the multipart field `key`.
    pub async fn form_file(&self, key: &str) -> Result<Option<FormFile>> {
        let form = self.form().await?;
        Ok(form.file(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::router::Router;
    use bytes::Bytes;
    use http::{Method, Request, StatusCode};
    use http_body_util::{BodyExt, Full};
    use std::sync::Arc;

    fn router() -> Arc<Router> {
        let mut router = Router::new();
        router.post("/form", |ctx: Context| async move {
            let name = ctx.form_value("name").await?.unwrap_or_default();
            let page = ctx.form_value("page").await?.unwrap_or_default();
            let file = ctx.form_file("avatar").await?;
            let file = file.map(|f| format!("{}:{}", f.file_name, f.data.len())).unwrap_or_default();
            ctx.text(format!("{name}|{page}|{file}"))
        });
        Arc::new(router)
    }

    async fn post(content_type: &str, body: &'static str) -> (StatusCode, Bytes) {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/form?page=3&name=query")
            .header(http::header::CONTENT_TYPE, content_type)
            .body(Full::from(body))
            .unwrap();
        let resp = router().serve(req, None).await;
        (resp.status(), resp.into_body().collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn test_urlencoded_body_wins_over_query() {
        let (status, body) = post("application/x-www-form-urlencoded", "name=hello&zip=world").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "hello|3|");
    }

    #[tokio::test]
    async fn test_multipart_file() {
        let body = "--XX\r\n\
                    Content-Disposition: form-data; name=\"name\"\r\n\r\n\
                    alice\r\n\
                    --XX\r\n\
                    Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
                    Content-Type: image/png\r\n\r\n\
                    PNGDATA\r\n\
                    --XX--\r\n";
        let (status, body) = post("multipart/form-data; boundary=XX", body).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "alice|3|a.png:7");
    }

    #[tokio::test]
    async fn test_broken_multipart_is_bad_request() {
        let (status, _) = post("multipart/form-data", "--XX\r\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
