//! Task records, typed generation parameters and dependency metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::FailureKind;

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a random task id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the job a task belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a random job id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Shape of the job that submitted a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One slideshow.
    Single,
    /// Many slideshows submitted together.
    Batch,
}

/// A task's place in a producer/consumer relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyRole {
    /// No dependency.
    #[serde(rename = "none")]
    Independent,
    /// Produces the result consumers of `group` need.
    Producer {
        /// Dependency group key.
        group: String,
    },
    /// Waits for the producer of `group`.
    Consumer {
        /// Dependency group key.
        group: String,
    },
}

impl DependencyRole {
    /// Group key, if the task participates in a dependency.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Independent => None,
            Self::Producer { group } | Self::Consumer { group } => Some(group),
        }
    }

    /// Whether this task waits on a producer.
    pub const fn is_consumer(&self) -> bool {
        matches!(self, Self::Consumer { .. })
    }
}

/// Role of a slide within a slideshow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlideKind {
    /// Opening slide.
    Hook,
    /// Content slide.
    Body,
    /// Product showcase.
    Product,
}

/// Parameters shared by every slide layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideParams {
    /// Role of the slide.
    pub slide_kind: SlideKind,
    /// Position of the slide in its slideshow.
    pub slide_index: u32,
    /// Scene the generator should render.
    pub scene_description: String,
    /// Overlay text.
    #[serde(default)]
    pub text_content: String,
    /// Where the overlay text should sit.
    #[serde(default)]
    pub text_position_hint: Option<String>,
    /// Image the scene is modelled on.
    #[serde(default)]
    pub reference_image_path: Option<PathBuf>,
    /// Product photo to composite.
    #[serde(default)]
    pub product_image_path: Option<PathBuf>,
    /// Product copy for the prompt.
    #[serde(default)]
    pub product_description: Option<String>,
    /// Whether the slide shows the recurring persona.
    #[serde(default)]
    pub has_persona: bool,
    /// Render without overlay text.
    #[serde(default)]
    pub clean_image_mode: bool,
    /// Variation index.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Free-form text and visual styling passed through to the generator.
    #[serde(default)]
    pub style: serde_json::Value,
}

const fn default_version() -> u32 {
    1
}

impl SlideParams {
    /// Minimal slide with a scene description.
    pub fn new(slide_kind: SlideKind, slide_index: u32, scene_description: impl Into<String>) -> Self {
        Self {
            slide_kind,
            slide_index,
            scene_description: scene_description.into(),
            text_content: String::new(),
            text_position_hint: None,
            reference_image_path: None,
            product_image_path: None,
            product_description: None,
            has_persona: false,
            clean_image_mode: false,
            version: default_version(),
            style: serde_json::Value::Null,
        }
    }

    /// Set the reference image.
    #[must_use]
    pub fn with_reference_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_image_path = Some(path.into());
        self
    }

    /// Set the product image.
    #[must_use]
    pub fn with_product_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.product_image_path = Some(path.into());
        self
    }

    /// Set the overlay text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = text.into();
        self
    }
}

/// Orientation of a split-screen slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOrientation {
    /// Side by side.
    Horizontal,
    /// Stacked.
    Vertical,
}

/// Layout of a split-screen slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// How the panels are arranged.
    pub orientation: SplitOrientation,
    /// Panel labels in order, e.g. `["before", "after"]`.
    pub sections: Vec<String>,
    /// Whether the panels show a before/after transformation.
    #[serde(default)]
    pub is_transformation: bool,
}

/// Split-screen slide parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitScreenParams {
    /// Common slide parameters.
    pub slide: SlideParams,
    /// Panel layout.
    pub split: SplitConfig,
}

/// Generation parameters, keyed by layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum TaskParams {
    /// One full-frame image.
    Single(SlideParams),
    /// Two or more panels in one frame.
    SplitScreen(SplitScreenParams),
}

impl TaskParams {
    /// Common slide parameters.
    pub const fn slide(&self) -> &SlideParams {
        match self {
            Self::Single(slide) => slide,
            Self::SplitScreen(params) => &params.slide,
        }
    }

    /// Reject parameters the generator could never act on.
    pub fn validate(&self) -> Result<(), String> {
        let slide = self.slide();
        if slide.scene_description.trim().is_empty() {
            return Err("scene_description must not be empty".into());
        }
        if slide.version == 0 {
            return Err("version must be greater than 0".into());
        }
        for path in self.input_paths() {
            if path.as_os_str().is_empty() {
                return Err("input paths must not be empty".into());
            }
        }
        if let Self::SplitScreen(params) = self {
            if params.split.sections.len() < 2 {
                return Err("split_screen needs at least two sections".into());
            }
            if params.split.sections.iter().any(|s| s.trim().is_empty()) {
                return Err("split_screen section labels must not be empty".into());
            }
        }
        Ok(())
    }

    /// Files that must exist for generation to proceed.
    pub fn input_paths(&self) -> Vec<&Path> {
        let slide = self.slide();
        slide
            .reference_image_path
            .iter()
            .chain(slide.product_image_path.iter())
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Membership state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting for its first attempt.
    Pending,
    /// Claimed by a scheduler.
    Processing,
    /// Waiting for another attempt.
    Retry,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl QueueState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Retry,
        Self::Completed,
        Self::Failed,
    ];

    /// Stable lowercase name, used in store keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of image generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Owning job.
    pub job_id: JobId,
    /// Shape of the owning job.
    pub job_kind: JobKind,
    /// Producer/consumer metadata.
    pub dependency: DependencyRole,
    /// What to generate.
    pub params: TaskParams,
    /// Where the generator should write the image.
    pub output_path: PathBuf,
    /// Result of the producer, attached when a consumer is pulled.
    #[serde(default)]
    pub producer_result: Option<String>,
    /// Attempts that counted against the retry budget.
    #[serde(default)]
    pub retry_count: u32,
    /// Error text of the latest failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Classification of the latest failure.
    #[serde(default)]
    pub last_failure: Option<FailureKind>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the latest attempt was claimed.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the latest failure was recorded.
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New independent task with a generated id.
    pub fn new(
        job_id: impl Into<JobId>,
        job_kind: JobKind,
        params: TaskParams,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            job_id: job_id.into(),
            job_kind,
            dependency: DependencyRole::Independent,
            params,
            output_path: output_path.into(),
            producer_result: None,
            retry_count: 0,
            last_error: None,
            last_failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_failed_at: None,
        }
    }

    /// Override the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Make this task the producer of `group`.
    #[must_use]
    pub fn producer_of(mut self, group: impl Into<String>) -> Self {
        self.dependency = DependencyRole::Producer {
            group: group.into(),
        };
        self
    }

    /// Make this task a consumer of `group`.
    #[must_use]
    pub fn consumer_of(mut self, group: impl Into<String>) -> Self {
        self.dependency = DependencyRole::Consumer {
            group: group.into(),
        };
        self
    }

    /// Files that must exist for this attempt: the parameter inputs plus,
    /// for a consumer, the image its producer wrote.
    pub fn input_paths(&self) -> Vec<&Path> {
        let mut paths = self.params.input_paths();
        if self.dependency.is_consumer() {
            if let Some(result) = &self.producer_result {
                paths.push(Path::new(result.as_str()));
            }
        }
        paths
    }

    /// Check parameters and dependency metadata.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.as_str().is_empty() {
            return Err("task id must not be empty".into());
        }
        if self.job_id.as_str().is_empty() {
            return Err("job id must not be empty".into());
        }
        if self.output_path.as_os_str().is_empty() {
            return Err("output_path must not be empty".into());
        }
        if let Some(group) = self.dependency.group() {
            if group.trim().is_empty() {
                return Err("dependency group must not be empty".into());
            }
        }
        self.params.validate()
    }
}

/// Lifecycle of a dependency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// Producer has not finished.
    Pending,
    /// Producer completed; consumers may run.
    Satisfied,
    /// Producer failed for good; consumers fail too.
    Failed,
}

/// Ledger entry linking a producer to its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Producer task.
    pub producer: TaskId,
    /// Current state; moves out of `Pending` once.
    pub state: DependencyState,
    /// Producer result once satisfied.
    #[serde(default)]
    pub result: Option<String>,
}
