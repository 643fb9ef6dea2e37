// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Prompt construction for image generation.
//!
//! A prompt is `{gender} {mode}, {background}`. The background city rotates
//! by weekday and the furry animal by day of year, both taken from the run
//! date so every user in a run sees the same scene.

use crate::models::{Gender, Mode, User};
use chrono::{Datelike, NaiveDate};

/// Backgrounds indexed by weekday, Monday first.
const CITIES: [&str; 7] = [
    "Seoul, Korea with vibrant neon-lit skyscrapers, traditional hanok rooftops, and cherry blossoms along modern streets",
    "Nara, Japan with ancient wooden temples, peaceful deer roaming through gardens, and traditional Japanese architecture",
    "Tokyo, Japan with towering skyscrapers, bustling Shibuya crossing, and bright neon signs illuminating the streets",
    "Taipei, Taiwan with Taipei 101 piercing the sky, night markets glowing with lanterns, and lush mountain backdrop",
    "Beijing, China with the majestic Forbidden City, traditional imperial architecture, and red palace walls",
    "Moscow, Russia with colorful onion domes of Saint Basil's Cathedral, Red Square, and snow-dusted architecture",
    "Hiroshima, Japan with the iconic Atomic Bomb Dome by the river, Peace Memorial Park, and modern cityscape beyond",
];

const FURRY_ANIMALS: [&str; 3] = ["wolf", "fox", "cat"];

const NEGATIVE_SHAME: &str = "blurry, low quality, distorted, deformed, monochrome, lowres, worst quality, low quality, muscular, fit, healthy, athletic, nude, naked, nudity, exposed genitals";
const NEGATIVE_DEFAULT: &str = "blurry, low quality, distorted, deformed, ugly, bad anatomy, monochrome, lowres, bad anatomy, worst quality, low quality, nude, naked, nudity, exposed genitals";
const NEGATIVE_FURRY: &str = "blurry, low quality, distorted, deformed, ugly, bad anatomy, lowres, worst quality, nude, naked, nudity, exposed genitals, animal face, animal head, snout, muzzle, whiskers, cartoon, anime, mask, helmet, human";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub prompt: String,
    pub negative_prompt: String,
}

/// Build the prompt pair for `user` on `date`.
pub fn prompt_for(user: &User, date: NaiveDate) -> Prompt {
    build_prompt(user.gender(), user.mode(), date)
}

pub fn build_prompt(gender: Gender, mode: Mode, date: NaiveDate) -> Prompt {
    let city = CITIES[date.weekday().num_days_from_monday() as usize % CITIES.len()];

    let gender_component = match gender {
        Gender::Female => "full body photo of a female in a two piece",
        Gender::Male => "full body photo of a male in underwear",
    };

    let (mode_component, negative_prompt) = match mode {
        Mode::Shame => (
            "who is obese, overweight, hairy, unhealthy, ill-looking, out of shape, slovenly appearance"
                .to_string(),
            NEGATIVE_SHAME,
        ),
        Mode::Toned => ("with toned athletic physique".to_string(), NEGATIVE_DEFAULT),
        Mode::Ripped => (
            "bodybuilder with extremely muscular physique".to_string(),
            NEGATIVE_DEFAULT,
        ),
        Mode::Furry => {
            let animal = FURRY_ANIMALS[date.ordinal() as usize % FURRY_ANIMALS.len()];
            (
                format!("human with an anthropomorphic {}-style furry body", animal),
                NEGATIVE_FURRY,
            )
        }
    };

    let background = format!("at {}, highly detailed, 8k, photorealistic", city);
    let prefix = if mode == Mode::Shame { "" } else { "professional " };

    Prompt {
        prompt: format!("{}{} {}, {}", prefix, gender_component, mode_component, background),
        negative_prompt: negative_prompt.to_string(),
    }
}
