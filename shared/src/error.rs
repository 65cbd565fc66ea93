use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTP errors
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("RTP header version must be 2")]
    ErrBadVersion,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("header extension id must be between 1 and 14 for RFC 5285 extensions")]
    ErrRfc8285OneByteHeaderIdRange,
    #[error("header extension payload must be 16 bytes or less for RFC 5285 one byte extensions")]
    ErrRfc8285OneByteHeaderSize,

    //RTCP errors
    #[error("packet too short to be read")]
    PacketTooShort,
    #[error("wrong marshal size")]
    WrongMarshalSize,
    #[error("wrong packet type")]
    WrongType,
    #[error("wrong feedback message type")]
    WrongFeedbackType,

    //RTP listener errors
    #[error("ssrc already exists in RTP listener [ssrc:{0}]")]
    DuplicatedSsrc(u32),
    #[error("muxId already exists in RTP listener [muxId:'{0}']")]
    DuplicatedMuxId(String),
    #[error("payloadType already exists in RTP listener [payloadType:{0}]")]
    DuplicatedPayloadType(u8),

    //Channel errors
    #[error("message too big")]
    ErrMessageTooBig,
    #[error("channel closed")]
    ErrChannelClosed,

    //Worker errors
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("room not found")]
    RoomNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("transport not found")]
    TransportNotFound,
    #[error("rtpReceiver not found")]
    RtpReceiverNotFound,
    #[error("invalid RtpParameters: {0}")]
    InvalidRtpParameters(String),
    #[error("{0}")]
    Internal(String),
}
