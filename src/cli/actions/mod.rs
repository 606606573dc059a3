pub mod server;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        audit_url: Option<String>,
        csrf_ttl_seconds: i64,
        stepup_window_seconds: i64,
    },
}
