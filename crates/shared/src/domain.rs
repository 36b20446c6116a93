use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(PyramidId);
id_newtype!(EventId);
id_newtype!(WordId);
id_newtype!(PromptId);

/// The transformation a pyramid step applies to its sentence. Every option
/// offered within a step carries the same tag as the step itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Expand,
    Shrink,
    Replace,
    Paraphrase,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Expand => "expand",
            StepType::Shrink => "shrink",
            StepType::Replace => "replace",
            StepType::Paraphrase => "paraphrase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Pyramid,
    Vocabulary,
    Writing,
}
