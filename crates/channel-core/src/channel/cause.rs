//! Q.931 hangup causes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason a call ended, using Q.931 cause codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HangupCause {
    UnallocatedNumber,
    NoRouteTransitNet,
    NoRouteDestination,
    ChannelUnacceptable,
    CallAwardedDelivered,
    #[default]
    NormalClearing,
    UserBusy,
    NoUserResponse,
    NoAnswer,
    CallRejected,
    NumberChanged,
    DestinationOutOfOrder,
    InvalidNumberFormat,
    FacilityRejected,
    ResponseToStatusEnquiry,
    NormalUnspecified,
    NormalCircuitCongestion,
    NetworkOutOfOrder,
    NormalTemporaryFailure,
    SwitchCongestion,
    AccessInfoDiscarded,
    RequestedChanUnavail,
    PreEmpted,
    FacilityNotSubscribed,
    OutgoingCallBarred,
    IncomingCallBarred,
    BearerCapabilityNotAuth,
    BearerCapabilityNotAvail,
    BearerCapabilityNotImpl,
    ChanNotImplemented,
    FacilityNotImplemented,
    InvalidCallReference,
    IncompatibleDestination,
    InvalidMsgUnspecified,
    MandatoryIeMissing,
    MessageTypeNonexist,
    WrongMessage,
    IeNonexist,
    InvalidIeContents,
    WrongCallState,
    RecoveryOnTimerExpire,
    MandatoryIeLengthError,
    ProtocolError,
    Interworking,
    Failure,
}

impl HangupCause {
    /// Q.931 numeric code
    pub fn code(self) -> u32 {
        use HangupCause::*;
        match self {
            UnallocatedNumber => 1,
            NoRouteTransitNet => 2,
            NoRouteDestination => 3,
            ChannelUnacceptable => 6,
            CallAwardedDelivered => 7,
            NormalClearing => 16,
            UserBusy => 17,
            NoUserResponse => 18,
            NoAnswer => 19,
            CallRejected => 21,
            NumberChanged => 22,
            DestinationOutOfOrder => 27,
            InvalidNumberFormat => 28,
            FacilityRejected => 29,
            ResponseToStatusEnquiry => 30,
            NormalUnspecified => 31,
            NormalCircuitCongestion => 34,
            NetworkOutOfOrder => 38,
            NormalTemporaryFailure => 41,
            SwitchCongestion => 42,
            AccessInfoDiscarded => 43,
            RequestedChanUnavail => 44,
            PreEmpted => 45,
            FacilityNotSubscribed => 50,
            OutgoingCallBarred => 52,
            IncomingCallBarred => 54,
            BearerCapabilityNotAuth => 57,
            BearerCapabilityNotAvail => 58,
            BearerCapabilityNotImpl => 65,
            ChanNotImplemented => 66,
            FacilityNotImplemented => 69,
            InvalidCallReference => 81,
            IncompatibleDestination => 88,
            InvalidMsgUnspecified => 95,
            MandatoryIeMissing => 96,
            MessageTypeNonexist => 97,
            WrongMessage => 98,
            IeNonexist => 99,
            InvalidIeContents => 100,
            WrongCallState => 101,
            RecoveryOnTimerExpire => 102,
            MandatoryIeLengthError => 103,
            ProtocolError => 111,
            Interworking => 127,
            Failure => 128,
        }
    }

    /// Human readable description, as reported in Hangup events
    pub fn description(self) -> &'static str {
        use HangupCause::*;
        match self {
            UnallocatedNumber => "Unallocated (unassigned) number",
            NoRouteTransitNet => "No route to specified transmit network",
            NoRouteDestination => "No route to destination",
            ChannelUnacceptable => "Channel unacceptable",
            CallAwardedDelivered => "Call awarded and being delivered in an established channel",
            NormalClearing => "Normal Clearing",
            UserBusy => "User busy",
            NoUserResponse => "No user responding",
            NoAnswer => "User alerting, no answer",
            CallRejected => "Call Rejected",
            NumberChanged => "Number changed",
            DestinationOutOfOrder => "Destination out of order",
            InvalidNumberFormat => "Invalid number format",
            FacilityRejected => "Facility rejected",
            ResponseToStatusEnquiry => "Response to STATus ENQuiry",
            NormalUnspecified => "Normal, unspecified",
            NormalCircuitCongestion => "Circuit/channel congestion",
            NetworkOutOfOrder => "Network out of order",
            NormalTemporaryFailure => "Temporary failure",
            SwitchCongestion => "Switching equipment congestion",
            AccessInfoDiscarded => "Access information discarded",
            RequestedChanUnavail => "Requested channel not available",
            PreEmpted => "Pre-empted",
            FacilityNotSubscribed => "Facility not subscribed",
            OutgoingCallBarred => "Outgoing call barred",
            IncomingCallBarred => "Incoming call barred",
            BearerCapabilityNotAuth => "Bearer capability not authorized",
            BearerCapabilityNotAvail => "Bearer capability not available",
            BearerCapabilityNotImpl => "Bearer capability not implemented",
            ChanNotImplemented => "Channel not implemented",
            FacilityNotImplemented => "Facility not implemented",
            InvalidCallReference => "Invalid call reference value",
            IncompatibleDestination => "Incompatible destination",
            InvalidMsgUnspecified => "Invalid message unspecified",
            MandatoryIeMissing => "Mandatory information element is missing",
            MessageTypeNonexist => "Message type nonexist.",
            WrongMessage => "Wrong message",
            IeNonexist => "Info. element nonexist or not implemented",
            InvalidIeContents => "Invalid information element contents",
            WrongCallState => "Message not compatible with call state",
            RecoveryOnTimerExpire => "Recover on timer expiry",
            MandatoryIeLengthError => "Mandatory IE length error",
            ProtocolError => "Protocol error, unspecified",
            Interworking => "Interworking, unspecified",
            Failure => "Failure",
        }
    }
}

/// Description of a hangup cause
pub fn cause2str(cause: HangupCause) -> &'static str {
    cause.description()
}

impl fmt::Display for HangupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}
