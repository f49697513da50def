//! Domain payloads carried by resources and claims.
//!
//! The arbitration engine treats payloads as opaque except for three
//! questions it must answer before touching the store: is the payload well
//! formed, when does the resource expire, and does a claim request fit the
//! resource it targets (a ride booking must name a destination the ride
//! actually serves).

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MarketError;

/// Maximum length of a claim message.
pub const MAX_CLAIM_MESSAGE_LEN: usize = 1000;

/// Maximum length of any other payload text field.
pub const MAX_TEXT_LEN: usize = 256;

/// Seats offered when a ride does not say otherwise.
pub const DEFAULT_SEATS: u8 = 4;

/// Largest number of seats a ride may offer.
pub const MAX_SEATS: u8 = 8;

/// Kind of a resource payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A ride offer with seat bookings.
    Ride,
    /// A lost-or-found item post with ownership claims.
    LostFound,
}

impl ResourceKind {
    /// Returns the storage label for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ride => "ride",
            Self::LostFound => "lost_found",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intermediate stop of a ride with its own price tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViaStop {
    /// Stop name.
    pub location: String,
    /// Price to travel to this stop.
    pub price: u32,
}

/// A ride offered by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideOffer {
    /// Start location.
    pub from: String,
    /// Final destination.
    pub to: String,
    /// Price to the final destination.
    pub price: u32,
    /// Intermediate stops, in route order.
    #[serde(default)]
    pub via: Vec<ViaStop>,
    /// Departure time.
    pub departure: DateTime<Utc>,
    /// Seats offered.
    #[serde(default = "default_seats")]
    pub seats: u8,
}

const fn default_seats() -> u8 {
    DEFAULT_SEATS
}

/// Whether a post reports a lost item or a found one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The poster lost the item.
    Lost,
    /// The poster found the item.
    Found,
}

impl ItemStatus {
    /// Returns the storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lost => "lost",
            Self::Found => "found",
        }
    }
}

/// A lost-and-found post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostFoundPost {
    /// Short title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Where the item was lost or found.
    pub location: String,
    /// Lost or found.
    pub status: ItemStatus,
    /// How to reach the poster.
    pub contact: String,
}

/// Payload of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourcePayload {
    /// Ride listing.
    Ride(RideOffer),
    /// Lost-and-found post.
    LostFound(LostFoundPost),
}

impl ResourcePayload {
    /// Returns the payload kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Ride(_) => ResourceKind::Ride,
            Self::LostFound(_) => ResourceKind::LostFound,
        }
    }

    /// Checks that the payload is well formed.
    pub fn validate(&self) -> Result<(), MarketError> {
        match self {
            Self::Ride(ride) => ride.validate(),
            Self::LostFound(post) => post.validate(),
        }
    }
}

impl RideOffer {
    fn validate(&self) -> Result<(), MarketError> {
        require_text("from", &self.from)?;
        require_text("to", &self.to)?;
        if self.from.trim() == self.to.trim() {
            return Err(MarketError::validation(
                "to",
                "destination must differ from the start location",
            ));
        }
        if !(1..=MAX_SEATS).contains(&self.seats) {
            return Err(MarketError::validation(
                "seats",
                format!("must be between 1 and {MAX_SEATS}, got {}", self.seats),
            ));
        }
        let mut seen = HashSet::with_capacity(self.via.len());
        for stop in &self.via {
            require_text("via.location", &stop.location)?;
            let location = stop.location.trim();
            if location == self.to.trim() {
                return Err(MarketError::validation(
                    "via.location",
                    format!("via stop '{location}' duplicates the final destination"),
                ));
            }
            if !seen.insert(location) {
                return Err(MarketError::validation(
                    "via.location",
                    format!("stop '{location}' is listed more than once"),
                ));
            }
        }
        Ok(())
    }

    /// Resolves the price for travelling to `destination`.
    ///
    /// The final destination always costs the ride's own `price`, whatever
    /// the via stops charge.
    fn price_to(&self, destination: &str) -> Option<u32> {
        let destination = destination.trim();
        if destination == self.to.trim() {
            return Some(self.price);
        }
        self.via
            .iter()
            .find(|stop| stop.location.trim() == destination)
            .map(|stop| stop.price)
    }
}

impl LostFoundPost {
    fn validate(&self) -> Result<(), MarketError> {
        require_text("title", &self.title)?;
        require_text("description", &self.description)?;
        require_text("location", &self.location)?;
        require_text("contact", &self.contact)
    }
}

fn require_text(field: &'static str, value: &str) -> Result<(), MarketError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MarketError::validation(field, "must not be empty"));
    }
    if trimmed.len() > MAX_TEXT_LEN {
        return Err(MarketError::validation(
            field,
            format!("exceeds {MAX_TEXT_LEN} bytes"),
        ));
    }
    Ok(())
}

/// What a claimant asks for when submitting a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimRequest {
    /// Book a seat to `destination` (the final stop or a via stop).
    Ride {
        /// Requested drop-off.
        destination: String,
    },
    /// Claim a lost-and-found item.
    Item {
        /// Message to the poster.
        #[serde(default)]
        message: String,
    },
}

/// Payload stored with a claim, resolved against its resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimPayload {
    /// Seat booking with the price tier fixed at submission time.
    RideBooking {
        /// Requested drop-off.
        destination: String,
        /// Price for that drop-off.
        price: u32,
    },
    /// Item claim.
    ItemClaim {
        /// Message to the poster.
        message: String,
    },
}

impl ClaimRequest {
    /// Resolves the request against the payload of the targeted resource.
    pub fn resolve(self, resource: &ResourcePayload) -> Result<ClaimPayload, MarketError> {
        match (self, resource) {
            (Self::Ride { destination }, ResourcePayload::Ride(ride)) => {
                let price = ride.price_to(&destination).ok_or_else(|| {
                    MarketError::validation(
                        "destination",
                        format!("ride does not stop at '{}'", destination.trim()),
                    )
                })?;
                Ok(ClaimPayload::RideBooking {
                    destination: destination.trim().to_string(),
                    price,
                })
            },
            (Self::Item { message }, ResourcePayload::LostFound(_)) => {
                let message = message.trim().to_string();
                if message.len() > MAX_CLAIM_MESSAGE_LEN {
                    return Err(MarketError::validation(
                        "message",
                        format!("exceeds {MAX_CLAIM_MESSAGE_LEN} bytes"),
                    ));
                }
                Ok(ClaimPayload::ItemClaim { message })
            },
            (_, resource) => Err(MarketError::validation(
                "kind",
                format!("claim does not match a {} resource", resource.kind()),
            )),
        }
    }
}

/// Derives resource deadlines from their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlinePolicy {
    /// Hour of the departure day (UTC) after which a ride is retired.
    pub ride_cutoff_hour: u32,
    /// How long a lost-and-found post stays open.
    pub lost_found_retention: Duration,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            ride_cutoff_hour: 20,
            lost_found_retention: Duration::days(7),
        }
    }
}

impl DeadlinePolicy {
    /// Returns the deadline of a resource created at `now`.
    ///
    /// A ride is retired at the cutoff hour of its departure day, or at
    /// departure if it leaves later than the cutoff. A ride whose deadline
    /// has already passed cannot be listed.
    pub fn deadline_for(
        &self,
        payload: &ResourcePayload,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, MarketError> {
        match payload {
            ResourcePayload::Ride(ride) => {
                let cutoff = ride
                    .departure
                    .date_naive()
                    .and_hms_opt(self.ride_cutoff_hour, 0, 0)
                    .ok_or_else(|| {
                        MarketError::validation(
                            "departure",
                            format!("invalid cutoff hour {}", self.ride_cutoff_hour),
                        )
                    })?
                    .and_utc();
                let deadline = cutoff.max(ride.departure);
                if deadline <= now {
                    return Err(MarketError::validation(
                        "departure",
                        "departure cutoff has already passed",
                    ));
                }
                Ok(Some(deadline))
            },
            ResourcePayload::LostFound(_) => now
                .checked_add_signed(self.lost_found_retention)
                .map(Some)
                .ok_or_else(|| {
                    MarketError::validation("lost_found_retention", "deadline is out of range")
                }),
        }
    }
}
