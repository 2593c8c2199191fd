use crate::template::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingPosition {
  TrimHorizon,
  Latest,
}

impl StartingPosition {
  pub fn as_str(self) -> &'static str {
    match self {
      StartingPosition::TrimHorizon => "TRIM_HORIZON",
      StartingPosition::Latest => "LATEST",
    }
  }
}

/// A pull subscription from a stream, queue or broker.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSourceMapping {
  pub source: Expr,
  pub batch_size: Option<u32>,
  pub starting_position: Option<StartingPosition>,
  pub enabled: bool,
}

impl EventSourceMapping {
  pub fn new(source: impl Into<Expr>) -> Self {
    Self {
      source: source.into(),
      batch_size: None,
      starting_position: None,
      enabled: true,
    }
  }

  pub fn batch_size(mut self, size: u32) -> Self {
    self.batch_size = Some(size);
    self
  }

  pub fn starting_position(mut self, position: StartingPosition) -> Self {
    self.starting_position = Some(position);
    self
  }

  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }
}
