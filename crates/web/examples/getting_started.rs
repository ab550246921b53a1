use arbor_web::middleware::{Control, Cors, Json, Limiter, Logger, Static, Timeout, TokenManager};
use arbor_web::{Context, Router, Server, StatusError};
use http::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug)]
pub struct User {
    name: String,
    zip: String,
}

// curl -v http://127.0.0.1:8080/users/42
async fn get_user(ctx: Context) -> arbor_web::Result<()> {
    let id = ctx.param("id");
    ctx.text(format!("u={id}\r\n"))
}

// curl -v -H 'Content-Type: application/json' -d '{"name":"hello","zip":"world"}' http://127.0.0.1:8080/users
async fn create_user(ctx: Context) -> arbor_web::Result<()> {
    let user: User = ctx.parse_json().await?;
    ctx.json(&user)
}

// curl -v -d "name=hello&zip=world" http://127.0.0.1:8080/form
async fn form(ctx: Context) -> arbor_web::Result<()> {
    let name = ctx.form_value("name").await?.ok_or_else(|| StatusError::bad_request("name is required"))?;
    ctx.text(format!("hello {name}\r\n"))
}

#[tokio::main]
async fn main() {
    let tokens = match TokenManager::new("session", "/", false, b"change me, i am not a secret") {
        Ok(tokens) => Arc::new(tokens),
        Err(e) => {
            eprintln!("token manager: {e}");
            return;
        }
    };

    let mut cors = Control::new("http://localhost:3000");
    cors.allow_methods = vec![Method::GET, Method::POST];
    cors.max_age = 600;

    let mut router = Router::new();
    router
        .middleware(Logger::new())
        .middleware(Timeout::new(Duration::from_secs(10)))
        .middleware(Limiter::builder().max_body(1 << 20).min_gap(Duration::from_millis(50)).build())
        .middleware(Cors::new([cors]))
        .middleware(Static::new("./public", 3600).gzip_ext("svg"));

    router.get("/users/:id", get_user).post("/users", create_user).post("/form", form);

    let issuer = Arc::clone(&tokens);
    router.post("/login", move |ctx: Context| {
        let issuer = Arc::clone(&issuer);
        async move {
            let user: User = ctx.parse_json().await?;
            issuer.create(&ctx, 3600, &Json(user))?;
            ctx.text("welcome\r\n")
        }
    });
    router.route("/me").middleware(tokens.checker::<Json<User>>(true));
    router.get("/me", |ctx: Context| async move {
        let user = ctx.get::<Json<User>>("session").ok_or_else(|| StatusError::unauthorized("no session"))?;
        ctx.json(&user.0)
    });

    let server = match Server::builder().router(router).address("127.0.0.1:8080").build() {
        Ok(server) => server,
        Err(e) => {
            eprintln!("build server: {e}");
            return;
        }
    };
    server.start().await;
}
