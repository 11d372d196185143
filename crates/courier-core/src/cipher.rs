//! Message-level cipher pipeline.
//!
//! Seals a [`Message`]'s `text` and `image` into base64 envelopes and opens
//! them again. Key selection follows the record's addressing: the direct key
//! of the two participants, or the group key at the record's
//! `encryptionKeyVersion`.
//!
//! Every nonce comes from [`Environment::random_bytes`]; nothing here holds
//! state, so one key can seal concurrently from many callers.
//!
//! Opening is strict. A payload that fails authentication is reported as
//! [`CoreError::DecryptionFailed`] and the ciphertext is never handed back as
//! if it were the body.

use courier_crypto::{Envelope, SymmetricKey, decrypt, encrypt};
use tracing::{debug, warn};

use crate::{
    env::Environment,
    error::CoreError,
    ids::{GroupId, MessageId, UserId},
    keys::{KeyCache, KeyManager},
    message::{MediaType, Message, Target},
    status::DeliveryStatus,
};

/// Version recorded on sealed direct messages. Direct keys are never rotated.
pub const DIRECT_KEY_VERSION: u32 = 1;

/// Plaintext content of an opened message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    /// Body
    pub text: String,
    /// Media reference
    pub image: Option<String>,
    /// Body before the first edit
    pub original_text: Option<String>,
}

/// Seal `plaintext` under `key` with a fresh nonce, base64-encoded.
pub fn seal_payload<E: Environment>(plaintext: &[u8], key: &SymmetricKey, env: &E) -> String {
    encrypt(plaintext, key, env.nonce()).encode()
}

/// Open a base64 envelope produced by [`seal_payload`].
///
/// # Errors
///
/// - `MalformedPayload` if `encoded` is not a well-formed envelope
/// - `DecryptionFailed` if authentication fails
pub fn open_payload(encoded: &str, key: &SymmetricKey) -> Result<Vec<u8>, CoreError> {
    let envelope = Envelope::decode(encoded)?;
    Ok(decrypt(&envelope, key)?)
}

/// Seal a plaintext direct message in place under the participants' key.
///
/// # Errors
///
/// - `InvalidAddressing`/`InvalidRecord` if the record is malformed, already
///   encrypted, or not a direct message
pub fn seal_direct<E: Environment, C: KeyCache>(
    message: &mut Message,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<(), CoreError> {
    let Target::Direct(receiver) = validate_plaintext(message)? else {
        return Err(CoreError::InvalidAddressing { reason: "expected a direct message" });
    };

    let key = keys.direct_key(&message.sender_id, &receiver);
    seal_fields(message, &key, DIRECT_KEY_VERSION, env);
    Ok(())
}

/// Seal a plaintext group message in place under the group's current key.
///
/// # Errors
///
/// - `InvalidAddressing`/`InvalidRecord` if the record is malformed, already
///   encrypted, or not a group message
/// - `InvalidGroup` if the group is unknown to `keys`
pub fn seal_group<E: Environment, C: KeyCache>(
    message: &mut Message,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<(), CoreError> {
    let Target::Group(group_id) = validate_plaintext(message)? else {
        return Err(CoreError::InvalidAddressing { reason: "expected a group message" });
    };

    let (key, version) = keys.group_key(&group_id, None)?;
    seal_fields(message, &key, version, env);
    Ok(())
}

/// Seal a plaintext message in place, picking the key from its addressing.
///
/// # Errors
///
/// See [`seal_direct`] and [`seal_group`].
pub fn seal<E: Environment, C: KeyCache>(
    message: &mut Message,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<(), CoreError> {
    match message.validate()? {
        Target::Direct(_) => seal_direct(message, keys, env),
        Target::Group(_) => seal_group(message, keys, env),
    }
}

/// Decrypt a sealed message.
///
/// Unencrypted records are returned as-is.
///
/// # Errors
///
/// - `InvalidGroup` if the record's key version is unknown to `keys`; observe
///   the rotation first and retry
/// - `DecryptionFailed` if any field fails authentication
/// - `MalformedPayload` if a field is not a well-formed envelope
/// - `InvalidRecord` if the plaintext is not UTF-8
pub fn open<C: KeyCache>(message: &Message, keys: &KeyManager<C>) -> Result<OpenedMessage, CoreError> {
    let target = message.validate()?;
    if !message.is_encrypted {
        return Ok(OpenedMessage {
            text: message.text.clone(),
            image: message.image.clone(),
            original_text: message.original_text.clone(),
        });
    }

    let key = key_for(message, &target, keys)?;
    let open_field = |encoded: &str| -> Result<String, CoreError> {
        let plaintext = open_payload(encoded, &key).inspect_err(|err| {
            warn!(message_id = %message.id, error = %err, "message could not be decrypted");
        })?;
        String::from_utf8(plaintext)
            .map_err(|_| CoreError::InvalidRecord { reason: "payload is not UTF-8" })
    };

    Ok(OpenedMessage {
        text: open_field(&message.text)?,
        image: message.image.as_deref().map(open_field).transpose()?,
        original_text: message.original_text.as_deref().map(open_field).transpose()?,
    })
}

/// New sealed direct message from `sender` to `receiver`, in `Sending` state.
///
/// # Errors
///
/// - `InvalidRecord` if the record cannot be sealed
pub fn compose_direct<E: Environment, C: KeyCache>(
    sender: &UserId,
    receiver: &UserId,
    text: &str,
    media: Option<(&str, MediaType)>,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<Message, CoreError> {
    let id = MessageId::from_random(env.random_u128());
    let mut message = Message::direct(id, sender.clone(), receiver.clone(), text, env.now());
    if let Some((image, media_type)) = media {
        message = message.with_media(image, media_type);
    }
    seal_direct(&mut message, keys, env)?;

    debug_assert_eq!(message.status, DeliveryStatus::Sending);
    Ok(message)
}

/// New sealed group message from `sender` to `group_id` under the group's
/// current key version, in `Sending` state.
///
/// # Errors
///
/// - `InvalidGroup` if the group is unknown to `keys`
pub fn compose_group<E: Environment, C: KeyCache>(
    sender: &UserId,
    group_id: &GroupId,
    text: &str,
    media: Option<(&str, MediaType)>,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<Message, CoreError> {
    let id = MessageId::from_random(env.random_u128());
    let mut message = Message::group(id, sender.clone(), group_id.clone(), text, env.now());
    if let Some((image, media_type)) = media {
        message = message.with_media(image, media_type);
    }
    seal_group(&mut message, keys, env)?;
    Ok(message)
}

/// Seal a replacement body for `message` under the key it was sealed with.
///
/// Pass the result to [`Message::edit`]. Plaintext records get the text back
/// unchanged.
///
/// # Errors
///
/// - `InvalidGroup` if the record's key version is unknown to `keys`
pub fn seal_edit<E: Environment, C: KeyCache>(
    message: &Message,
    text: &str,
    keys: &KeyManager<C>,
    env: &E,
) -> Result<String, CoreError> {
    let target = message.validate()?;
    if !message.is_encrypted {
        return Ok(text.to_string());
    }

    let key = key_for(message, &target, keys)?;
    Ok(seal_payload(text.as_bytes(), &key, env))
}

fn validate_plaintext(message: &Message) -> Result<Target, CoreError> {
    let target = message.validate()?;
    if message.is_encrypted {
        return Err(CoreError::InvalidRecord { reason: "message is already encrypted" });
    }
    Ok(target)
}

fn seal_fields<E: Environment>(message: &mut Message, key: &SymmetricKey, version: u32, env: &E) {
    message.text = seal_payload(message.text.as_bytes(), key, env);
    if let Some(image) = message.image.take() {
        message.image = Some(seal_payload(image.as_bytes(), key, env));
    }
    if let Some(original) = message.original_text.take() {
        message.original_text = Some(seal_payload(original.as_bytes(), key, env));
    }
    message.is_encrypted = true;
    message.encryption_key_version = Some(version);

    debug!(message_id = %message.id, key_version = version, "message sealed");
}

fn key_for<C: KeyCache>(
    message: &Message,
    target: &Target,
    keys: &KeyManager<C>,
) -> Result<SymmetricKey, CoreError> {
    match target {
        Target::Direct(receiver) => Ok(keys.direct_key(&message.sender_id, receiver)),
        Target::Group(group_id) => {
            Ok(keys.group_key(group_id, message.encryption_key_version)?.0)
        },
    }
}
