mod settings;

pub use settings::{
    DatabaseConfig, NotificationsConfig, ServerConfig, Settings, SettingsError, StoreConfig,
    TemplateHelpers, WebhookConfig,
};
