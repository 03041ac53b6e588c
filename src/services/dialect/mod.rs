pub mod rules;
pub mod translator;

pub use rules::{DialectFeature, DialectForm, DialectRuleSet, RewriteKind};
pub use translator::DialectTranslationService;
