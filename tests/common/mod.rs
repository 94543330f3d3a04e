//! 测试公共模块
//! 提供测试应用构建、请求发送与登录辅助函数

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use security_core::{
    config::AppConfig, middleware::AppState, models::account::ROLE_ADMIN, routes, store::Store,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

pub const TEST_PASSWORD: &str = "TestPass123";

/// 默认连接地址，测试配置中为受信任代理
pub const LOOPBACK_PEER: &str = "127.0.0.1:40000";

/// 测试应用（内存存储）
pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
}

/// 请求结果
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.json["data"]
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// 已登录用户
pub struct TestUser {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
}

/// 创建测试应用
pub fn spawn_app() -> TestApp {
    spawn_app_with(|_| {})
}

/// 创建测试应用，允许调整配置
pub fn spawn_app_with(configure: impl FnOnce(&mut AppConfig)) -> TestApp {
    let mut config = AppConfig::for_testing();
    configure(&mut config);

    let state = AppState::build(config, Store::in_memory(), None)
        .expect("Failed to build test app state");
    let router = routes::create_router(state.clone());

    TestApp { state, router }
}

/// 请求构建器
pub struct RequestSpec {
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    peer: SocketAddr,
}

pub fn get(uri: &str) -> RequestSpec {
    RequestSpec::new(Method::GET, uri)
}

pub fn post(uri: &str) -> RequestSpec {
    RequestSpec::new(Method::POST, uri)
}

pub fn delete(uri: &str) -> RequestSpec {
    RequestSpec::new(Method::DELETE, uri)
}

impl RequestSpec {
    fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
            body: None,
            peer: LOOPBACK_PEER.parse().unwrap(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", &format!("Bearer {}", token))
    }

    pub fn csrf(self, token: &str) -> Self {
        self.header("x-csrf-token", token)
    }

    /// 模拟来自指定地址的连接
    pub fn peer(mut self, addr: &str) -> Self {
        self.peer = addr.parse().unwrap();
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn build(self) -> Request<Body> {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .extension(ConnectInfo(self.peer));
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = match self.body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        builder.body(body).unwrap()
    }
}

impl TestApp {
    /// 发送请求并解析 JSON 响应
    pub async fn send(&self, spec: RequestSpec) -> TestResponse {
        self.send_raw(spec.build()).await
    }

    pub async fn send_raw(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse {
            status,
            headers,
            json,
        }
    }

    /// 获取一个新的 CSRF 令牌
    pub async fn csrf_token(&self) -> String {
        let response = self.send(get("/api/csrf-token")).await;
        assert_eq!(response.status, StatusCode::OK);
        response.data()["csrf_token"].as_str().unwrap().to_string()
    }

    /// 携带认证与 CSRF 令牌的修改类请求
    pub async fn send_authed(&self, spec: RequestSpec, access_token: &str) -> TestResponse {
        let csrf = self.csrf_token().await;
        self.send(spec.bearer(access_token).csrf(&csrf)).await
    }

    pub async fn register(&self, email: &str, password: &str) -> TestResponse {
        self.send(
            post("/api/auth/register").json(json!({ "email": email, "password": password })),
        )
        .await
    }

    pub async fn login(&self, email: &str, password: &str) -> TestResponse {
        self.send(post("/api/auth/login").json(json!({ "email": email, "password": password })))
            .await
    }

    /// 注册并登录普通用户
    pub async fn register_and_login(&self, email: &str) -> TestUser {
        let registered = self.register(email, TEST_PASSWORD).await;
        assert_eq!(registered.status, StatusCode::CREATED);

        self.login_user(email).await
    }

    pub async fn login_user(&self, email: &str) -> TestUser {
        let response = self.login(email, TEST_PASSWORD).await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.json);
        to_test_user(email, &response)
    }

    /// 直接在仓库中创建管理员并登录
    pub async fn create_admin(&self, email: &str) -> TestUser {
        let hash = self.state.hasher.hash(TEST_PASSWORD).unwrap();
        self.state
            .accounts
            .create(email, &hash, ROLE_ADMIN)
            .await
            .unwrap();

        self.login_user(email).await
    }
}

pub fn to_test_user(email: &str, response: &TestResponse) -> TestUser {
    let data = response.data();
    TestUser {
        user_id: data["user"]["id"].as_str().unwrap().to_string(),
        email: email.to_string(),
        access_token: data["access_token"].as_str().unwrap().to_string(),
        refresh_token: data["refresh_token"].as_str().unwrap().to_string(),
        session_id: data["session_id"].as_str().unwrap().to_string(),
    }
}
