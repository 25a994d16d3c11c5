use once_cell::sync::OnceCell;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 全局复用的 HTTP Client（统一连接池/Keep-Alive），避免每次请求重复创建。
///
/// 说明：
/// - provider token 交换、宿主状态回调都是短请求，共用 30s client；
/// - 下载流的超时可配置，按 timeout 维度缓存 client。
/// - `Client` 本身是线程安全的，clone 只是增加引用计数。
static CLIENT_TIMEOUT_30S: OnceCell<Client> = OnceCell::new();
static STREAM_CLIENTS: OnceCell<Mutex<HashMap<Duration, Client>>> = OnceCell::new();

/// TCP keep-alive 探测间隔（下载可能持续十几分钟，中途长时间无数据）
const STREAM_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// timeout=30s 的 HTTP Client（OAuth token 交换、状态回调）。
pub fn client_timeout_30s() -> Result<&'static Client, reqwest::Error> {
    CLIENT_TIMEOUT_30S
        .get_or_try_init(|| Client::builder().timeout(Duration::from_secs(30)).build())
}

/// 下载流使用的 Client：整体超时 = `timeout`，开启 TCP keep-alive。
pub fn stream_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let cache = STREAM_CLIENTS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock()
        && let Some(client) = guard.get(&timeout)
    {
        return Ok(client.clone());
    }

    let client = Client::builder()
        .timeout(timeout)
        .tcp_keepalive(STREAM_TCP_KEEPALIVE)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    if let Ok(mut guard) = cache.lock() {
        guard.entry(timeout).or_insert_with(|| client.clone());
    }
    Ok(client)
}
