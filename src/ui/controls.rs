//! Voice controls UI component.
//!
//! Renders one row per voice (name, play/stop button, last note) and the
//! shared note set, rhythm and direction pickers.

use std::fmt;

use iced::widget::{button, column, container, pick_list, row, text};
use iced::{Background, Border, Color, Element, Length, Theme};

use arpeggiator::midi::note_name;
use arpeggiator::{Direction, FiredNote};

const COL_NAME_WIDTH: f32 = 90.0;
const COL_BUTTON_WIDTH: f32 = 80.0;
const COL_NOTE_WIDTH: f32 = 160.0;
const PICKER_WIDTH: f32 = 150.0;
const ROW_HEIGHT: f32 = 40.0;

/// Chord voicings offered in the note picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotePreset {
    CMajor,
    G7,
    FMajor,
    DMinor9,
}

impl NotePreset {
    pub const ALL: [NotePreset; 4] = [
        NotePreset::CMajor,
        NotePreset::G7,
        NotePreset::FMajor,
        NotePreset::DMinor9,
    ];

    pub fn notes(self) -> Vec<u8> {
        match self {
            NotePreset::CMajor => vec![60, 64, 67, 72],
            NotePreset::G7 => vec![55, 59, 62, 65, 67, 71],
            NotePreset::FMajor => vec![60, 65, 69],
            NotePreset::DMinor9 => vec![50, 53, 57, 60, 64],
        }
    }
}

impl fmt::Display for NotePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotePreset::CMajor => "C major",
            NotePreset::G7 => "G7",
            NotePreset::FMajor => "F major",
            NotePreset::DMinor9 => "D minor 9",
        };
        write!(f, "{}", name)
    }
}

/// Grid / length pairs offered in the rhythm picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhythmPreset {
    Sixteenths,
    Triplets,
    DottedEighths,
    StaccatoQuarters,
}

impl RhythmPreset {
    pub const ALL: [RhythmPreset; 4] = [
        RhythmPreset::Sixteenths,
        RhythmPreset::Triplets,
        RhythmPreset::DottedEighths,
        RhythmPreset::StaccatoQuarters,
    ];

    /// (note grid, note length ratio)
    pub fn rhythm(self) -> (u64, f64) {
        match self {
            RhythmPreset::Sixteenths => (120, 1.0),
            RhythmPreset::Triplets => (160, 1.0),
            RhythmPreset::DottedEighths => (240, 0.75),
            RhythmPreset::StaccatoQuarters => (480, 0.25),
        }
    }
}

impl fmt::Display for RhythmPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RhythmPreset::Sixteenths => "1/16",
            RhythmPreset::Triplets => "1/8 triplets",
            RhythmPreset::DottedEighths => "1/8 at 3/4",
            RhythmPreset::StaccatoQuarters => "1/4 staccato",
        };
        write!(f, "{}", name)
    }
}

fn row_background(playing: bool) -> Color {
    if playing {
        Color::from_rgb(0.15, 0.45, 0.15) // Green
    } else {
        Color::from_rgb(0.12, 0.12, 0.12) // Dark grey
    }
}

fn cell_color() -> Color {
    Color::from_rgb(0.9, 0.9, 0.9)
}

fn label_color() -> Color {
    Color::from_rgb(0.7, 0.7, 0.7)
}

/// Render one voice row.
pub fn view_voice_row<'a, M: 'a + Clone>(
    name: &'a str,
    playing: bool,
    last_note: Option<FiredNote>,
    on_toggle: M,
) -> Element<'a, M> {
    let txt_color = cell_color();

    let toggle = button(text(if playing { "Stop" } else { "Play" }).size(14).color(txt_color))
        .on_press(on_toggle)
        .padding([4, 12])
        .style(move |_theme, _status| button::Style {
            background: Some(Background::Color(Color::from_rgb(0.25, 0.25, 0.25))),
            text_color: txt_color,
            border: Border::default().rounded(2),
            ..Default::default()
        });

    let note = match last_note {
        Some(n) if n.embellishments.any() => format!("{} *", note_name(n.pitch)),
        Some(n) => note_name(n.pitch),
        None => "--".to_string(),
    };

    container(
        row![
            container(text(name).size(16).color(txt_color))
                .width(Length::Fixed(COL_NAME_WIDTH))
                .padding([4, 8])
                .center_y(Length::Fixed(ROW_HEIGHT)),
            container(toggle)
                .width(Length::Fixed(COL_BUTTON_WIDTH))
                .padding([2, 4])
                .center_y(Length::Fixed(ROW_HEIGHT)),
            container(text(note).size(16).color(txt_color))
                .width(Length::Fixed(COL_NOTE_WIDTH))
                .padding([4, 8])
                .center_y(Length::Fixed(ROW_HEIGHT)),
        ]
        .spacing(2),
    )
    .style(move |_theme: &Theme| container::Style {
        background: Some(Background::Color(row_background(playing))),
        border: Border::default().rounded(2),
        ..Default::default()
    })
    .height(Length::Fixed(ROW_HEIGHT))
    .into()
}

/// Render the note set, rhythm and direction pickers.
pub fn view_pickers<'a, M: 'a + Clone>(
    notes: NotePreset,
    rhythm: RhythmPreset,
    direction: Direction,
    on_notes: impl Fn(NotePreset) -> M + 'a,
    on_rhythm: impl Fn(RhythmPreset) -> M + 'a,
    on_direction: impl Fn(Direction) -> M + 'a,
) -> Element<'a, M> {
    let lbl_color = label_color();
    let labelled = |label: &'a str, picker: Element<'a, M>| -> Element<'a, M> {
        column![text(label).size(12).color(lbl_color), picker]
            .spacing(4)
            .into()
    };

    row![
        labelled(
            "NOTES",
            pick_list(NotePreset::ALL, Some(notes), on_notes)
                .text_size(14)
                .width(Length::Fixed(PICKER_WIDTH))
                .into(),
        ),
        labelled(
            "RHYTHM",
            pick_list(RhythmPreset::ALL, Some(rhythm), on_rhythm)
                .text_size(14)
                .width(Length::Fixed(PICKER_WIDTH))
                .into(),
        ),
        labelled(
            "DIRECTION",
            pick_list(Direction::ALL, Some(direction), on_direction)
                .text_size(14)
                .width(Length::Fixed(PICKER_WIDTH))
                .into(),
        ),
    ]
    .spacing(12)
    .into()
}
