use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a lead sits in the discovery → review → outreach pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadLifecycleState {
    Discovered,
    Analyzing,
    Analyzed,
    PendingReview,
    Approved,
    Rejected,
    ReadyForOutreach,
    Failed,
    Expired,
}

impl LeadLifecycleState {
    pub const ALL: [LeadLifecycleState; 9] = [
        LeadLifecycleState::Discovered,
        LeadLifecycleState::Analyzing,
        LeadLifecycleState::Analyzed,
        LeadLifecycleState::PendingReview,
        LeadLifecycleState::Approved,
        LeadLifecycleState::Rejected,
        LeadLifecycleState::ReadyForOutreach,
        LeadLifecycleState::Failed,
        LeadLifecycleState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadLifecycleState::Discovered => "discovered",
            LeadLifecycleState::Analyzing => "analyzing",
            LeadLifecycleState::Analyzed => "analyzed",
            LeadLifecycleState::PendingReview => "pending_review",
            LeadLifecycleState::Approved => "approved",
            LeadLifecycleState::Rejected => "rejected",
            LeadLifecycleState::ReadyForOutreach => "ready_for_outreach",
            LeadLifecycleState::Failed => "failed",
            LeadLifecycleState::Expired => "expired",
        }
    }

    /// Legacy rows carry only a review status; this is the lifecycle state they map onto.
    pub fn from_review_status(review: ReviewStatus) -> Self {
        match review {
            ReviewStatus::Approved => LeadLifecycleState::Approved,
            ReviewStatus::Rejected => LeadLifecycleState::Rejected,
            ReviewStatus::Pending | ReviewStatus::Expired => LeadLifecycleState::PendingReview,
        }
    }
}

impl fmt::Display for LeadLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadLifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeadLifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle state: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            "expired" => Ok(ReviewStatus::Expired),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachStatus {
    #[default]
    NotSent,
    SentInitial,
    SentFollowup,
    Replied,
    Bounced,
    Failed,
}

impl OutreachStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutreachStatus::NotSent => "not_sent",
            OutreachStatus::SentInitial => "sent_initial",
            OutreachStatus::SentFollowup => "sent_followup",
            OutreachStatus::Replied => "replied",
            OutreachStatus::Bounced => "bounced",
            OutreachStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutreachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutreachStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_sent" => Ok(OutreachStatus::NotSent),
            "sent_initial" => Ok(OutreachStatus::SentInitial),
            "sent_followup" => Ok(OutreachStatus::SentFollowup),
            "replied" => Ok(OutreachStatus::Replied),
            "bounced" => Ok(OutreachStatus::Bounced),
            "failed" => Ok(OutreachStatus::Failed),
            other => Err(format!("unknown outreach status: {other}")),
        }
    }
}

/// A prospective business contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub business_name: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub website_url: Option<String>,
    pub email: Option<String>,
    /// `None` on rows written before lifecycle tracking existed.
    pub lifecycle_state: Option<LeadLifecycleState>,
    pub review_status: ReviewStatus,
    pub outreach_status: OutreachStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_contacted: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Lead {
    /// A freshly discovered lead waiting for analysis.
    pub fn discovered(business_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_name: business_name.into(),
            category: None,
            location: None,
            website_url: None,
            email: None,
            lifecycle_state: Some(LeadLifecycleState::Discovered),
            review_status: ReviewStatus::Pending,
            outreach_status: OutreachStatus::NotSent,
            discovered_at: Utc::now(),
            last_contacted: None,
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_lifecycle_state(mut self, state: Option<LeadLifecycleState>) -> Self {
        self.lifecycle_state = state;
        self
    }

    pub fn with_review_status(mut self, review: ReviewStatus) -> Self {
        self.review_status = review;
        self
    }

    pub fn with_outreach_status(mut self, outreach: OutreachStatus) -> Self {
        self.outreach_status = outreach;
        self
    }

    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Recorded lifecycle state, or the one derived from the review status for legacy rows.
    pub fn effective_lifecycle_state(&self) -> LeadLifecycleState {
        self.lifecycle_state
            .unwrap_or_else(|| LeadLifecycleState::from_review_status(self.review_status))
    }

    /// Approved by a human, has somewhere to send to, and has not been emailed yet.
    pub fn is_outreach_eligible(&self) -> bool {
        self.review_status == ReviewStatus::Approved
            && self.has_email()
            && self.outreach_status == OutreachStatus::NotSent
    }

    pub fn is_followup_due(&self, delay_days: u32, now: DateTime<Utc>) -> bool {
        if self.review_status != ReviewStatus::Approved
            || self.outreach_status != OutreachStatus::SentInitial
        {
            return false;
        }
        match self.last_contacted {
            Some(contacted) => now - contacted >= Duration::days(i64::from(delay_days)),
            None => false,
        }
    }
}

/// Partial update applied to a single lead row. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadPatch {
    pub lifecycle_state: Option<LeadLifecycleState>,
    pub review_status: Option<ReviewStatus>,
    pub outreach_status: Option<OutreachStatus>,
    pub email: Option<String>,
    pub last_contacted: Option<DateTime<Utc>>,
}

impl LeadPatch {
    pub fn apply_to(&self, lead: &mut Lead, now: DateTime<Utc>) {
        if let Some(state) = self.lifecycle_state {
            lead.lifecycle_state = Some(state);
        }
        if let Some(review) = self.review_status {
            lead.review_status = review;
        }
        if let Some(outreach) = self.outreach_status {
            lead.outreach_status = outreach;
        }
        if let Some(email) = &self.email {
            lead.email = Some(email.clone());
        }
        if let Some(contacted) = self.last_contacted {
            lead.last_contacted = Some(contacted);
        }
        lead.updated_at = Some(now);
    }
}

/// Counts by review and outreach status for the status screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadCounts {
    pub total: usize,
    pub pending_review: usize,
    pub approved: usize,
    pub rejected: usize,
    pub sent_initial: usize,
    pub sent_followup: usize,
    pub replied: usize,
}

impl LeadCounts {
    pub fn tally<'a>(leads: impl IntoIterator<Item = &'a Lead>) -> Self {
        let mut counts = LeadCounts::default();
        for lead in leads {
            counts.total += 1;
            match lead.review_status {
                ReviewStatus::Pending => counts.pending_review += 1,
                ReviewStatus::Approved => counts.approved += 1,
                ReviewStatus::Rejected => counts.rejected += 1,
                ReviewStatus::Expired => {}
            }
            match lead.outreach_status {
                OutreachStatus::SentInitial => counts.sent_initial += 1,
                OutreachStatus::SentFollowup => counts.sent_followup += 1,
                OutreachStatus::Replied => counts.replied += 1,
                _ => {}
            }
        }
        counts
    }
}
