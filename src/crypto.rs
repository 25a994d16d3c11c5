//! 加密信封
//!
//! 用于在不可信的重定向链路上携带 OAuth state / token。
//!
//! - 算法：AES-256-GCM，每次加密使用新的 96-bit 随机 nonce；
//! - cipher id 作为 AAD 参与认证，换标签的密文无法解密；
//! - 密文格式：`base64url_nopad(nonce ‖ ciphertext ‖ tag)`；
//! - 同时可注册多个 cipher id，解密按 id 分派，加密始终使用主 id。

use std::collections::HashMap;
use std::fmt;

use aes_gcm::{
    Aes256Gcm, KeyInit as _, Nonce,
    aead::{Aead, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CryptoConfig;
use crate::error::HubError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// 加密后的载荷。JSON 形态为 `{"cid": ..., "payload": ...}`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// cipher id，决定用哪把密钥解密
    pub cid: String,
    /// base64url 密文
    pub payload: String,
}

impl EncryptedPayload {
    /// URL 紧凑形态：`<cid>.<payload>`（base64url 字母表不含 `.`）
    pub fn to_token(&self) -> String {
        format!("{}.{}", self.cid, self.payload)
    }

    pub fn from_token(token: &str) -> Result<Self, HubError> {
        let (cid, payload) = token
            .split_once('.')
            .ok_or_else(|| HubError::Decrypt("state 令牌缺少 cipher id".into()))?;
        if !is_valid_cipher_id(cid) || payload.is_empty() {
            return Err(HubError::Decrypt("state 令牌格式无效".into()));
        }
        Ok(Self {
            cid: cid.to_string(),
            payload: payload.to_string(),
        })
    }

    /// 尝试把任意 JSON 文本识别为加密信封；不是信封则返回 None。
    pub fn from_json_str(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;
        let cid = obj.get("cid")?.as_str()?;
        let payload = obj.get("payload")?.as_str()?;
        Some(Self {
            cid: cid.to_string(),
            payload: payload.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// cipher id 只允许 `[A-Za-z0-9_-]`，保证令牌形态无歧义
pub fn is_valid_cipher_id(cid: &str) -> bool {
    !cid.is_empty()
        && cid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// 多 cipher id 密钥环
#[derive(Clone)]
pub struct ActionCrypto {
    primary: String,
    keys: HashMap<String, Aes256Gcm>,
}

impl fmt::Debug for ActionCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("ActionCrypto")
            .field("primary", &self.primary)
            .field("cipher_ids", &ids)
            .finish()
    }
}

impl ActionCrypto {
    /// 用主密钥创建密钥环
    pub fn new(primary_cid: &str, key: &[u8; KEY_LEN]) -> Result<Self, HubError> {
        if !is_valid_cipher_id(primary_cid) {
            return Err(HubError::CryptoConfig(format!(
                "cipher id 含非法字符: {primary_cid:?}"
            )));
        }
        let mut keys = HashMap::new();
        keys.insert(primary_cid.to_string(), build_cipher(key)?);
        Ok(Self {
            primary: primary_cid.to_string(),
            keys,
        })
    }

    /// 追加一把只用于解密的旧密钥
    pub fn with_retired_key(mut self, cid: &str, key: &[u8; KEY_LEN]) -> Result<Self, HubError> {
        if !is_valid_cipher_id(cid) {
            return Err(HubError::CryptoConfig(format!("cipher id 含非法字符: {cid:?}")));
        }
        if cid == self.primary {
            return Err(HubError::CryptoConfig(format!(
                "退役密钥与主密钥 cipher id 重复: {cid}"
            )));
        }
        self.keys.insert(cid.to_string(), build_cipher(key)?);
        Ok(self)
    }

    /// 按配置从进程环境变量读取密钥
    pub fn from_config(cfg: &CryptoConfig) -> Result<Self, HubError> {
        Self::from_lookup(cfg, |name| std::env::var(name).ok())
    }

    /// 使用全局配置构建
    pub fn from_global() -> Result<Self, HubError> {
        Self::from_config(&crate::config::AppConfig::global().crypto)
    }

    /// 与 `from_config` 相同，但密钥来源可注入（便于测试）
    pub fn from_lookup(
        cfg: &CryptoConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, HubError> {
        let primary_key = read_key(&cfg.master_key_env, &lookup)?;
        tracing::debug!(
            "加载主密钥: cid = {}, fingerprint = {}",
            cfg.primary_cipher_id,
            key_fingerprint(&primary_key)
        );
        let mut crypto = Self::new(&cfg.primary_cipher_id, &primary_key)?;
        for retired in &cfg.retired_keys {
            let key = read_key(&retired.key_env, &lookup)?;
            tracing::debug!(
                "加载退役密钥: cid = {}, fingerprint = {}",
                retired.cipher_id,
                key_fingerprint(&key)
            );
            crypto = crypto.with_retired_key(&retired.cipher_id, &key)?;
        }
        Ok(crypto)
    }

    pub fn primary_cipher_id(&self) -> &str {
        &self.primary
    }

    pub fn has_cipher_id(&self, cid: &str) -> bool {
        self.keys.contains_key(cid)
    }

    /// 使用主密钥加密
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedPayload, HubError> {
        let cipher = self
            .keys
            .get(&self.primary)
            .ok_or_else(|| HubError::CryptoConfig("主密钥未注册".into()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ct = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: self.primary.as_bytes(),
                },
            )
            .map_err(|_| HubError::Internal("AES-GCM 加密失败".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);

        Ok(EncryptedPayload {
            cid: self.primary.clone(),
            payload: URL_SAFE_NO_PAD.encode(out),
        })
    }

    /// 按 cid 分派解密；任何失败都不会返回明文
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<String, HubError> {
        let cipher = self
            .keys
            .get(&payload.cid)
            .ok_or_else(|| HubError::Decrypt(format!("未知的 cipher id: {}", payload.cid)))?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload.payload.as_bytes())
            .map_err(|e| HubError::Decrypt(format!("密文 base64 无效: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(HubError::Decrypt("密文长度不足".into()));
        }
        let (nonce, ct) = raw.split_at(NONCE_LEN);

        let pt = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ct,
                    aad: payload.cid.as_bytes(),
                },
            )
            .map_err(|_| HubError::Decrypt("认证标签校验失败".into()))?;

        String::from_utf8(pt).map_err(|_| HubError::Decrypt("明文不是合法 UTF-8".into()))
    }
}

fn build_cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm, HubError> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| HubError::CryptoConfig(format!("AES-GCM 初始化失败: {e}")))
}

fn read_key(
    env_name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<[u8; KEY_LEN], HubError> {
    let raw = lookup(env_name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HubError::CryptoConfig(format!("环境变量 {env_name} 未设置")))?;
    parse_key_hex(env_name, raw.trim())
}

/// 解析 64 位十六进制密钥
pub fn parse_key_hex(name: &str, raw: &str) -> Result<[u8; KEY_LEN], HubError> {
    let bytes = hex::decode(raw)
        .map_err(|e| HubError::CryptoConfig(format!("{name} 不是合法的十六进制: {e}")))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        HubError::CryptoConfig(format!(
            "{name} 长度应为 {KEY_LEN} 字节，实际 {} 字节",
            v.len()
        ))
    })
}

/// 生成一把新的十六进制密钥（部署/测试辅助）
pub fn generate_key_hex() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// 密钥指纹（sha256 前 8 位），只用于日志
fn key_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..4])
}
