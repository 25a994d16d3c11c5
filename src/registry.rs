//! 动作注册表：启动时一次性构建，之后只读。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::{Value, json};

use crate::action::Action;
use crate::error::HubError;

static REGISTRY: OnceCell<Arc<ActionRegistry>> = OnceCell::new();

/// 注册阶段使用的构建器
#[derive(Default)]
pub struct RegistryBuilder {
    actions: Vec<Arc<dyn Action>>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.actions.iter().map(|a| a.name()).collect();
        f.debug_struct("RegistryBuilder").field("actions", &names).finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名动作重复注册视为启动错误
    pub fn register<A: Action + 'static>(self, action: A) -> Result<Self, HubError> {
        self.register_arc(Arc::new(action))
    }

    pub fn register_arc(mut self, action: Arc<dyn Action>) -> Result<Self, HubError> {
        if self.actions.iter().any(|a| a.name() == action.name()) {
            return Err(HubError::Internal(format!(
                "动作重复注册: {}",
                action.name()
            )));
        }
        tracing::debug!("注册动作: {}", action.name());
        self.actions.push(action);
        Ok(self)
    }

    /// 白名单为空表示不过滤
    pub fn build(self, whitelist: &[String]) -> ActionRegistry {
        let index = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name().to_string(), i))
            .collect();
        let whitelist = if whitelist.is_empty() {
            None
        } else {
            Some(whitelist.iter().cloned().collect())
        };
        ActionRegistry {
            actions: self.actions,
            index,
            whitelist,
        }
    }
}

/// 只读的动作集合（按注册顺序）
pub struct ActionRegistry {
    actions: Vec<Arc<dyn Action>>,
    index: HashMap<String, usize>,
    whitelist: Option<HashSet<String>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.actions.iter().map(|a| a.name()).collect();
        f.debug_struct("ActionRegistry")
            .field("actions", &names)
            .field("whitelist", &self.whitelist)
            .finish()
    }
}

impl ActionRegistry {
    fn visible(&self, action: &dyn Action, caller_version: Option<&semver::Version>) -> bool {
        let whitelisted = self
            .whitelist
            .as_ref()
            .is_none_or(|w| w.contains(action.name()));
        whitelisted && action.descriptor().is_supported_by(caller_version)
    }

    /// 白名单与调用方版本过滤后的动作
    pub fn all_actions(&self, caller_version: Option<&semver::Version>) -> Vec<Arc<dyn Action>> {
        self.actions
            .iter()
            .filter(|a| self.visible(a.as_ref(), caller_version))
            .cloned()
            .collect()
    }

    pub fn find_action(
        &self,
        id: &str,
        caller_version: Option<&semver::Version>,
    ) -> Result<Arc<dyn Action>, HubError> {
        self.index
            .get(id)
            .map(|&i| &self.actions[i])
            .filter(|a| self.visible(a.as_ref(), caller_version))
            .cloned()
            .ok_or_else(|| HubError::ActionNotFound("No action found.".into()))
    }

    /// 扩展动作不受白名单与版本过滤
    pub fn find_extended_action(&self, id: &str) -> Result<Arc<dyn Action>, HubError> {
        self.index
            .get(id)
            .map(|&i| &self.actions[i])
            .filter(|a| a.descriptor().extended_action)
            .cloned()
            .ok_or_else(|| HubError::ActionNotFound("No action found.".into()))
    }

    /// 动作列表（宿主的 `/` 接口）
    pub fn describe(&self, base_url: &str, caller_version: Option<&semver::Version>) -> Value {
        let integrations: Vec<Value> = self
            .all_actions(caller_version)
            .iter()
            .map(|a| action_json(a.as_ref(), base_url, caller_version))
            .collect();
        json!({ "integrations": integrations })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// 单个动作的对外描述
pub fn action_json(
    action: &dyn Action,
    base_url: &str,
    caller_version: Option<&semver::Version>,
) -> Value {
    let d = action.descriptor();
    let base = base_url.trim_end_matches('/');
    let params: Vec<Value> = d
        .params
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "label": p.label,
                "required": p.required,
                "sensitive": p.sensitive,
                "description": p.description,
            })
        })
        .collect();
    let form_url = action
        .has_form()
        .then(|| format!("{base}/actions/{}/form", d.name));
    let supported_types: Vec<&str> = d.supported_action_types.iter().map(|k| k.as_str()).collect();
    let download_settings = if d.uses_streaming { "url" } else { "push" };
    json!({
        "name": d.name,
        "label": d.label,
        "description": d.description,
        "url": format!("{base}/actions/{}/execute", d.name),
        "form_url": form_url,
        "supported_action_types": supported_types,
        "supported_formats": d.formats_for(caller_version),
        "supported_formattings": d.supported_formattings,
        "supported_visualization_formattings": d.supported_visualization_formattings,
        "supported_download_settings": [download_settings],
        "required_fields": d.required_fields,
        "params": params,
        "uses_oauth": action.as_oauth().is_some(),
        "delegate_oauth": action.as_delegate_oauth().is_some(),
    })
}

/// 安装全局注册表（只能一次）
pub fn install_global(registry: ActionRegistry) -> Result<Arc<ActionRegistry>, HubError> {
    let registry = Arc::new(registry);
    REGISTRY
        .set(registry.clone())
        .map_err(|_| HubError::Internal("动作注册表已经被初始化".into()))?;
    Ok(registry)
}

pub fn global() -> Option<Arc<ActionRegistry>> {
    REGISTRY.get().cloned()
}
