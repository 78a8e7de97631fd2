//! Task-parameter resolver
//!
//! Merges global classifier defaults with per-task overrides into one
//! immutable [`TaskParams`] record per task. When shared pair-attention is
//! enabled globally, the attention triple comes from the global settings for
//! every task, overriding any per-task value.

use crate::config::ModelConfig;

/// Resolved classifier hyperparameters for one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskParams {
    pub cls_type: String,
    pub d_hid: usize,
    pub d_proj: usize,
    pub shared_pair_attn: bool,
    pub attn: bool,
    pub d_hid_attn: usize,
    pub dropout: f32,
    /// Edge-probing loss function; other tasks ignore it.
    pub cls_loss_fn: String,
    /// Edge-probing span pooling strategy; other tasks ignore it.
    pub cls_span_pooling: String,
    pub edgeprobe_cnn_context: usize,
    /// Name of the task whose classifier this task uses; defaults to the
    /// task's own name.
    pub use_classifier: String,
}

/// Resolve the parameters for one task from globals and overrides.
pub fn resolve_task_params(cfg: &ModelConfig, task_name: &str) -> TaskParams {
    let ov = cfg.overrides_for(task_name);

    let (attn, d_hid_attn, dropout) = if cfg.shared_pair_attn {
        // Shared attention: globals win for every task.
        (cfg.pair_attn, cfg.d_hid_attn, cfg.classifier_dropout)
    } else {
        (
            ov.pair_attn.unwrap_or(cfg.pair_attn),
            ov.d_hid_attn.unwrap_or(cfg.d_hid_attn),
            ov.classifier_dropout.unwrap_or(cfg.classifier_dropout),
        )
    };

    TaskParams {
        cls_type: ov.classifier.unwrap_or_else(|| cfg.classifier.clone()),
        d_hid: ov.classifier_hid_dim.unwrap_or(cfg.classifier_hid_dim),
        d_proj: ov.d_proj.unwrap_or(cfg.d_proj),
        shared_pair_attn: cfg.shared_pair_attn,
        attn,
        d_hid_attn,
        dropout,
        cls_loss_fn: ov
            .classifier_loss_fn
            .unwrap_or_else(|| cfg.classifier_loss_fn.clone()),
        cls_span_pooling: ov
            .classifier_span_pooling
            .unwrap_or_else(|| cfg.classifier_span_pooling.clone()),
        edgeprobe_cnn_context: ov.edgeprobe_cnn_context.unwrap_or(cfg.edgeprobe_cnn_context),
        use_classifier: ov
            .use_classifier
            .filter(|s| !s.is_empty() && s != "none")
            .unwrap_or_else(|| task_name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskOverrides;

    #[test]
    fn test_defaults_apply_without_overrides() {
        let cfg = ModelConfig::tiny();
        let params = resolve_task_params(&cfg, "sst2");
        assert_eq!(params.cls_type, cfg.classifier);
        assert_eq!(params.d_proj, cfg.d_proj);
        assert_eq!(params.use_classifier, "sst2");
    }

    #[test]
    fn test_per_task_override_wins() {
        let mut cfg = ModelConfig::tiny();
        cfg.task_overrides.insert(
            "sst2".to_string(),
            TaskOverrides {
                classifier: Some("log_reg".to_string()),
                d_proj: Some(32),
                ..TaskOverrides::default()
            },
        );
        let params = resolve_task_params(&cfg, "sst2");
        assert_eq!(params.cls_type, "log_reg");
        assert_eq!(params.d_proj, 32);
        // Other tasks keep defaults.
        let other = resolve_task_params(&cfg, "mnli");
        assert_eq!(other.cls_type, cfg.classifier);
    }

    #[test]
    fn test_shared_pair_attn_overrides_per_task_attention() {
        let mut cfg = ModelConfig::tiny();
        cfg.shared_pair_attn = true;
        cfg.pair_attn = true;
        cfg.d_hid_attn = 64;
        cfg.task_overrides.insert(
            "rte".to_string(),
            TaskOverrides {
                pair_attn: Some(false),
                d_hid_attn: Some(4),
                ..TaskOverrides::default()
            },
        );
        let params = resolve_task_params(&cfg, "rte");
        assert!(params.attn, "global attention must win under shared_pair_attn");
        assert_eq!(params.d_hid_attn, 64);
    }

    #[test]
    fn test_use_classifier_defaults_to_own_name() {
        let mut cfg = ModelConfig::tiny();
        cfg.task_overrides.insert(
            "mnli-diagnostic".to_string(),
            TaskOverrides {
                use_classifier: Some("mnli".to_string()),
                ..TaskOverrides::default()
            },
        );
        assert_eq!(
            resolve_task_params(&cfg, "mnli-diagnostic").use_classifier,
            "mnli"
        );
        assert_eq!(resolve_task_params(&cfg, "mnli").use_classifier, "mnli");
    }

    #[test]
    fn test_empty_and_none_use_classifier_fall_back() {
        let mut cfg = ModelConfig::tiny();
        cfg.task_overrides.insert(
            "spr1".to_string(),
            TaskOverrides {
                use_classifier: Some("none".to_string()),
                ..TaskOverrides::default()
            },
        );
        assert_eq!(resolve_task_params(&cfg, "spr1").use_classifier, "spr1");
    }
}
